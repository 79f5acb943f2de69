//! Key derivation, HMAC and fingerprint helpers for `MESSAGE-INTEGRITY`,
//! `MESSAGE-INTEGRITY-SHA256` and `FINGERPRINT`.
//!
//! Grounded on `faster-stun::util` (`mycrl-turn-rs/stun/src/util.rs`):
//! same long-term key derivation (`MD5(username ":" realm ":" password)`)
//! and the same CRC-32/ISO-HDLC-XOR-0x5354554e fingerprint. The HMAC
//! comparison uses `hmac::Mac::verify_slice`, which compares in constant
//! time, satisfying spec §4.1's "must be constant-time" requirement.

use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// A key usable to compute/check `MESSAGE-INTEGRITY` (HMAC-SHA1) and/or
/// `MESSAGE-INTEGRITY-SHA256` (HMAC-SHA256).
#[derive(Debug, Clone)]
pub enum IntegrityKey {
    /// ICE short-term credentials: key is the peer ufrag's password,
    /// taken as already SASLprep-normalized bytes (SASLprep is an
    /// external collaborator, out of scope per spec §1).
    ShortTerm(Vec<u8>),
    /// TURN/long-term credentials: key = MD5(username ":" realm ":" password).
    LongTermSha1([u8; 16]),
    /// Same input, SHA-256 digest, used with MESSAGE-INTEGRITY-SHA256.
    LongTermSha256([u8; 32]),
}

impl IntegrityKey {
    fn as_bytes(&self) -> &[u8] {
        match self {
            IntegrityKey::ShortTerm(pw) => pw,
            IntegrityKey::LongTermSha1(k) => k,
            IntegrityKey::LongTermSha256(k) => k,
        }
    }
}

/// `key = MD5(username ":" realm ":" password)`, RFC 8489 §9.2.2.
pub fn long_term_key_md5(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// SHA-256 variant used for MESSAGE-INTEGRITY-SHA256, RFC 8489 §14.6.
pub fn long_term_key_sha256(username: &str, realm: &str, password: &str) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

pub fn hmac_sha1(key: &IntegrityKey, data: &[u8]) -> [u8; 20] {
    let mut mac = Hmac::<sha1::Sha1>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn hmac_sha256(key: &IntegrityKey, data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison, delegated to `hmac::Mac::verify_slice`.
pub fn verify_sha1(key: &IntegrityKey, data: &[u8], expected: &[u8]) -> bool {
    match Hmac::<sha1::Sha1>::new_from_slice(key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_slice(expected).is_ok()
        }
        Err(_) => false,
    }
}

/// `expected` may be left-truncated to 16/20/24 bytes (spec §4.1
/// permits a shortened MESSAGE-INTEGRITY-SHA256); `verify_truncated_left`
/// accepts that directly instead of requiring a full 32-byte tag.
pub fn verify_sha256(key: &IntegrityKey, data: &[u8], expected: &[u8]) -> bool {
    match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_truncated_left(expected).is_ok()
        }
        Err(_) => false,
    }
}

/// CRC-32/ISO-HDLC of `data`, XORed with the STUN magic constant.
pub fn fingerprint(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data) ^ FINGERPRINT_XOR
}
