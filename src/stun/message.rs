//! STUN message framing: header, attribute walk, `write`/`read`/
//! `check_integrity` per spec §4.1.

use std::net::SocketAddr;

use super::attrs::{self, ErrorCode};
use super::integrity::{self, IntegrityKey};
use super::{Class, TransactionId, COOKIE};
use crate::error::StunError;

fn pad_size(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// A single STUN attribute as found on the wire: its type code and raw
/// value bytes (still subject to the attribute-specific decoding the
/// typed accessors on [`Message`] perform).
type RawAttr<'a> = (u16, &'a [u8]);

/// A parsed, borrowed STUN message. Validity of `FINGERPRINT` (if
/// present) has already been checked by [`read`]; `MESSAGE-INTEGRITY`
/// is checked separately via [`check_integrity`] since it requires a
/// key the codec doesn't own.
#[derive(Debug)]
pub struct Message<'a> {
    class: Class,
    method: u16,
    transaction_id: TransactionId,
    buf: &'a [u8],
    attrs: Vec<RawAttr<'a>>,
    has_integrity: bool,
    has_integrity_sha256: bool,
    integrity_offset: Option<usize>,
    integrity_sha256_offset: Option<usize>,
}

impl<'a> Message<'a> {
    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> u16 {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn has_integrity(&self) -> bool {
        self.has_integrity || self.has_integrity_sha256
    }

    fn attr(&self, kind: u16) -> Option<&'a [u8]> {
        self.attrs.iter().find(|(k, _)| *k == kind).map(|(_, v)| *v)
    }

    pub fn username(&self) -> Option<&'a str> {
        self.attr(attrs::USERNAME).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn userhash(&self) -> Option<&'a [u8]> {
        self.attr(attrs::USERHASH)
    }

    pub fn realm(&self) -> Option<&'a str> {
        self.attr(attrs::REALM).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn nonce(&self) -> Option<&'a str> {
        self.attr(attrs::NONCE).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn software(&self) -> Option<&'a str> {
        self.attr(attrs::SOFTWARE).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn mapped_address(&self) -> Option<Result<SocketAddr, StunError>> {
        self.attr(attrs::MAPPED_ADDRESS)
            .map(|v| attrs::decode_address(v, &self.transaction_id, false))
    }

    pub fn xor_mapped_address(&self) -> Option<Result<SocketAddr, StunError>> {
        self.attr(attrs::XOR_MAPPED_ADDRESS)
            .map(|v| attrs::decode_address(v, &self.transaction_id, true))
    }

    pub fn xor_peer_address(&self) -> Option<Result<SocketAddr, StunError>> {
        self.attr(attrs::XOR_PEER_ADDRESS)
            .map(|v| attrs::decode_address(v, &self.transaction_id, true))
    }

    pub fn xor_relayed_address(&self) -> Option<Result<SocketAddr, StunError>> {
        self.attr(attrs::XOR_RELAYED_ADDRESS)
            .map(|v| attrs::decode_address(v, &self.transaction_id, true))
    }

    pub fn alternate_server(&self) -> Option<Result<SocketAddr, StunError>> {
        self.attr(attrs::ALTERNATE_SERVER)
            .map(|v| attrs::decode_address(v, &self.transaction_id, false))
    }

    pub fn error_code(&self) -> Option<Result<ErrorCode, StunError>> {
        self.attr(attrs::ERROR_CODE).map(attrs::decode_error_code)
    }

    pub fn unknown_attributes(&self) -> Option<Vec<u16>> {
        self.attr(attrs::UNKNOWN_ATTRIBUTES).map(attrs::decode_unknown_attributes)
    }

    pub fn priority(&self) -> Option<u32> {
        self.attr(attrs::PRIORITY)
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_be_bytes(v.try_into().unwrap()))
    }

    pub fn use_candidate(&self) -> bool {
        self.attr(attrs::USE_CANDIDATE).is_some()
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        self.attr(attrs::ICE_CONTROLLING)
            .filter(|v| v.len() == 8)
            .map(|v| u64::from_be_bytes(v.try_into().unwrap()))
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        self.attr(attrs::ICE_CONTROLLED)
            .filter(|v| v.len() == 8)
            .map(|v| u64::from_be_bytes(v.try_into().unwrap()))
    }

    pub fn lifetime(&self) -> Option<u32> {
        self.attr(attrs::LIFETIME)
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_be_bytes(v.try_into().unwrap()))
    }

    pub fn channel_number(&self) -> Option<u16> {
        self.attr(attrs::CHANNEL_NUMBER)
            .filter(|v| v.len() >= 2)
            .map(|v| u16::from_be_bytes([v[0], v[1]]))
    }

    pub fn data(&self) -> Option<&'a [u8]> {
        self.attr(attrs::DATA)
    }

    pub fn dont_fragment(&self) -> bool {
        self.attr(attrs::DONT_FRAGMENT).is_some()
    }

    pub fn requested_transport_udp(&self) -> bool {
        self.attr(attrs::REQUESTED_TRANSPORT).is_some_and(|v| v.first() == Some(&17))
    }

    pub fn password_algorithms(&self) -> Option<&'a [u8]> {
        self.attr(attrs::PASSWORD_ALGORITHMS)
    }

    /// Recompute and check `MESSAGE-INTEGRITY`/`MESSAGE-INTEGRITY-SHA256`
    /// against `key`, per spec §4.1. Prefers SHA-256 if present.
    pub fn check_integrity(&self, key: &IntegrityKey) -> bool {
        if let Some(off) = self.integrity_sha256_offset {
            let Some(value) = self.attr(attrs::MESSAGE_INTEGRITY_SHA256) else {
                return false;
            };
            let region = self.region_before(off, value.len());
            return integrity::verify_sha256(key, &region, value);
        }

        if let Some(off) = self.integrity_offset {
            let Some(value) = self.attr(attrs::MESSAGE_INTEGRITY) else {
                return false;
            };
            let region = self.region_before(off, value.len());
            return integrity::verify_sha1(key, &region, value);
        }

        false
    }

    /// `buf[0..off]` with the length header rewritten as if the message
    /// ended right after the integrity/fingerprint attribute at `off`
    /// with value length `val_len` — the "dummy length" trick (spec §4.1).
    fn region_before(&self, off: usize, val_len: usize) -> Vec<u8> {
        let mut region = self.buf[..off].to_vec();
        let new_len = (off + val_len - 16) as u16;
        region[2..4].copy_from_slice(&new_len.to_be_bytes());
        region
    }
}

/// Parse and validate a STUN message, per spec §4.1. Validates the
/// magic cookie, the length header, attribute framing (rejecting
/// unknown required-range attributes, skipping unknown optional-range
/// ones) and, if present, `FINGERPRINT`.
pub fn read(buf: &[u8]) -> Result<Message<'_>, StunError> {
    if buf.len() < 20 {
        return Err(StunError::HeaderTooShort);
    }

    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;

    if buf[4..8] != COOKIE.to_be_bytes() {
        return Err(StunError::BadMagicCookie);
    }

    if buf.len() != 20 + length {
        return Err(StunError::LengthMismatch);
    }

    let (method, class) = super::decode_type(msg_type);

    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&buf[8..20]);
    let transaction_id = TransactionId(transaction_id);

    let mut attrs_out = Vec::new();
    let mut has_integrity = false;
    let mut has_integrity_sha256 = false;
    let mut integrity_offset = None;
    let mut integrity_sha256_offset = None;
    let mut fingerprint_offset = None;
    let mut fingerprint_value: Option<&[u8]> = None;

    let mut offset = 20;
    while offset < buf.len() {
        if buf.len() - offset < 4 {
            return Err(StunError::TruncatedAttributeHeader);
        }

        let kind = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let val_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let val_start = offset + 4;
        let val_end = val_start + val_len;

        if val_end > buf.len() {
            return Err(StunError::TruncatedAttributeValue);
        }

        let value = &buf[val_start..val_end];

        if kind == attrs::MESSAGE_INTEGRITY {
            has_integrity = true;
            integrity_offset = Some(offset);
        } else if kind == attrs::MESSAGE_INTEGRITY_SHA256 {
            has_integrity_sha256 = true;
            integrity_sha256_offset = Some(offset);
        } else if kind == attrs::FINGERPRINT {
            fingerprint_offset = Some(offset);
            fingerprint_value = Some(value);
        }

        if !attrs::KNOWN_ATTRIBUTES.contains(&kind) {
            if attrs::is_required_range(kind) {
                return Err(StunError::UnknownRequiredAttribute(kind));
            }
            // Comprehension-optional and unrecognized: skip without storing.
            offset = val_end + pad_size(val_len);
            continue;
        }

        attrs_out.push((kind, value));
        offset = val_end + pad_size(val_len);
    }

    if let (Some(off), Some(value)) = (fingerprint_offset, fingerprint_value) {
        if value.len() != 4 {
            return Err(StunError::BadAttributeLength("FINGERPRINT"));
        }
        let mut region = buf[..off].to_vec();
        let new_len = (off + value.len() - 16) as u16;
        region[2..4].copy_from_slice(&new_len.to_be_bytes());
        let expect = integrity::fingerprint(&region);
        let actual = u32::from_be_bytes(value.try_into().unwrap());
        if expect != actual {
            return Err(StunError::BadFingerprint);
        }
    }

    Ok(Message {
        class,
        method,
        transaction_id,
        buf,
        attrs: attrs_out,
        has_integrity,
        has_integrity_sha256,
        integrity_offset,
        integrity_sha256_offset,
    })
}

/// How (if at all) a written message should be authenticated, per spec
/// §4.1: short-term for ICE checks, long-term for TURN.
pub enum Auth<'a> {
    None,
    ShortTerm { password: &'a [u8] },
    LongTermSha1 { key: [u8; 16] },
    LongTermSha256 { key: [u8; 32] },
}

/// Incrementally builds a STUN message, appending attributes in the
/// order given, then `MESSAGE-INTEGRITY`(-SHA256) and `FINGERPRINT` on
/// [`finish`](MessageBuilder::finish), per spec §4.1.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(class: Class, method: u16, transaction_id: TransactionId) -> Self {
        let mut buf = Vec::with_capacity(128);
        let msg_type = super::encode_type(method, class);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&COOKIE.to_be_bytes());
        buf.extend_from_slice(&transaction_id.0);
        Self { buf }
    }

    fn append(&mut self, kind: u16, value: &[u8]) {
        self.buf.extend_from_slice(&kind.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self.buf.extend(std::iter::repeat(0u8).take(pad_size(value.len())));
    }

    pub fn add_username(&mut self, username: &str) -> &mut Self {
        self.append(attrs::USERNAME, username.as_bytes());
        self
    }

    pub fn add_userhash(&mut self, hash: &[u8; 32]) -> &mut Self {
        self.append(attrs::USERHASH, hash);
        self
    }

    pub fn add_realm(&mut self, realm: &str) -> &mut Self {
        self.append(attrs::REALM, realm.as_bytes());
        self
    }

    pub fn add_nonce(&mut self, nonce: &str) -> &mut Self {
        self.append(attrs::NONCE, nonce.as_bytes());
        self
    }

    pub fn add_software(&mut self, software: &str) -> &mut Self {
        self.append(attrs::SOFTWARE, software.as_bytes());
        self
    }

    pub fn add_mapped_address(&mut self, addr: SocketAddr) -> &mut Self {
        let tid = self.transaction_id();
        let mut v = Vec::new();
        attrs::encode_address(addr, &tid, false, &mut v);
        self.append(attrs::MAPPED_ADDRESS, &v);
        self
    }

    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) -> &mut Self {
        let tid = self.transaction_id();
        let mut v = Vec::new();
        attrs::encode_address(addr, &tid, true, &mut v);
        self.append(attrs::XOR_MAPPED_ADDRESS, &v);
        self
    }

    pub fn add_xor_peer_address(&mut self, addr: SocketAddr) -> &mut Self {
        let tid = self.transaction_id();
        let mut v = Vec::new();
        attrs::encode_address(addr, &tid, true, &mut v);
        self.append(attrs::XOR_PEER_ADDRESS, &v);
        self
    }

    pub fn add_xor_relayed_address(&mut self, addr: SocketAddr) -> &mut Self {
        let tid = self.transaction_id();
        let mut v = Vec::new();
        attrs::encode_address(addr, &tid, true, &mut v);
        self.append(attrs::XOR_RELAYED_ADDRESS, &v);
        self
    }

    pub fn add_error_code(&mut self, code: u16, reason: &str) -> &mut Self {
        let mut v = Vec::new();
        attrs::encode_error_code(code, reason, &mut v);
        self.append(attrs::ERROR_CODE, &v);
        self
    }

    pub fn add_unknown_attributes(&mut self, kinds: &[u16]) -> &mut Self {
        let mut v = Vec::new();
        attrs::encode_unknown_attributes(kinds, &mut v);
        self.append(attrs::UNKNOWN_ATTRIBUTES, &v);
        self
    }

    pub fn add_priority(&mut self, priority: u32) -> &mut Self {
        self.append(attrs::PRIORITY, &priority.to_be_bytes());
        self
    }

    pub fn add_use_candidate(&mut self) -> &mut Self {
        self.append(attrs::USE_CANDIDATE, &[]);
        self
    }

    pub fn add_ice_controlling(&mut self, tiebreaker: u64) -> &mut Self {
        self.append(attrs::ICE_CONTROLLING, &tiebreaker.to_be_bytes());
        self
    }

    pub fn add_ice_controlled(&mut self, tiebreaker: u64) -> &mut Self {
        self.append(attrs::ICE_CONTROLLED, &tiebreaker.to_be_bytes());
        self
    }

    pub fn add_lifetime(&mut self, seconds: u32) -> &mut Self {
        self.append(attrs::LIFETIME, &seconds.to_be_bytes());
        self
    }

    pub fn add_requested_transport_udp(&mut self) -> &mut Self {
        self.append(attrs::REQUESTED_TRANSPORT, &[17, 0, 0, 0]);
        self
    }

    pub fn add_dont_fragment(&mut self) -> &mut Self {
        self.append(attrs::DONT_FRAGMENT, &[]);
        self
    }

    pub fn add_channel_number(&mut self, channel: u16) -> &mut Self {
        self.append(attrs::CHANNEL_NUMBER, &[(channel >> 8) as u8, channel as u8, 0, 0]);
        self
    }

    pub fn add_data(&mut self, data: &[u8]) -> &mut Self {
        self.append(attrs::DATA, data);
        self
    }

    fn transaction_id(&self) -> TransactionId {
        let mut id = [0u8; 12];
        id.copy_from_slice(&self.buf[8..20]);
        TransactionId(id)
    }

    /// Append integrity (if requested) and `FINGERPRINT`, and return
    /// the finished datagram. Mirrors spec §4.1's "dummy length" trick:
    /// the length header is updated before each digest is computed.
    pub fn finish(mut self, auth: Auth<'_>) -> Vec<u8> {
        self.write_length(self.buf.len() - 20);

        match auth {
            Auth::None => {}
            Auth::ShortTerm { password } => {
                self.append_integrity_sha1(&IntegrityKey::ShortTerm(password.to_vec()));
            }
            Auth::LongTermSha1 { key } => {
                self.append_integrity_sha1(&IntegrityKey::LongTermSha1(key));
            }
            Auth::LongTermSha256 { key } => {
                self.append_integrity_sha256(&IntegrityKey::LongTermSha256(key));
            }
        }

        self.append_fingerprint();
        self.buf
    }

    fn write_length(&mut self, attrs_len: usize) {
        let len = attrs_len as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    fn append_integrity_sha1(&mut self, key: &IntegrityKey) {
        self.write_length(self.buf.len() - 20 + 4 + 20);
        let mac = integrity::hmac_sha1(key, &self.buf);
        self.append(attrs::MESSAGE_INTEGRITY, &mac);
    }

    fn append_integrity_sha256(&mut self, key: &IntegrityKey) {
        self.write_length(self.buf.len() - 20 + 4 + 32);
        let mac = integrity::hmac_sha256(key, &self.buf);
        self.append(attrs::MESSAGE_INTEGRITY_SHA256, &mac);
    }

    fn append_fingerprint(&mut self) {
        self.write_length(self.buf.len() - 20 + 8);
        let fp = integrity::fingerprint(&self.buf);
        self.append(attrs::FINGERPRINT, &fp.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::{method, Class};

    #[test]
    fn write_then_read_roundtrip_with_short_term_integrity() {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        builder.add_username("bob:alice").add_priority(1234);
        let datagram = builder.finish(Auth::ShortTerm { password: b"swordfish" });

        let msg = read(&datagram).unwrap();
        assert_eq!(msg.class(), Class::Request);
        assert_eq!(msg.method(), method::BINDING);
        assert_eq!(msg.transaction_id(), tid);
        assert_eq!(msg.username(), Some("bob:alice"));
        assert_eq!(msg.priority(), Some(1234));
        assert!(msg.has_integrity());
        assert!(msg.check_integrity(&IntegrityKey::ShortTerm(b"swordfish".to_vec())));
        assert!(!msg.check_integrity(&IntegrityKey::ShortTerm(b"wrong".to_vec())));
    }

    #[test]
    fn fingerprint_is_always_last_and_integrity_precedes_it() {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        builder.add_username("x");
        let datagram = builder.finish(Auth::ShortTerm { password: b"pw" });

        // Last attribute is FINGERPRINT (8 bytes: 4 header + 4 value).
        let fp_type = u16::from_be_bytes([datagram[datagram.len() - 8], datagram[datagram.len() - 7]]);
        assert_eq!(fp_type, attrs::FINGERPRINT);

        // The 24 bytes before that are MESSAGE-INTEGRITY (4 header + 20 value).
        let mi_start = datagram.len() - 8 - 24;
        let mi_type = u16::from_be_bytes([datagram[mi_start], datagram[mi_start + 1]]);
        assert_eq!(mi_type, attrs::MESSAGE_INTEGRITY);
    }

    #[test]
    fn tampered_username_fails_integrity_but_is_still_flagged_present() {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        builder.add_username("bob");
        let mut datagram = builder.finish(Auth::ShortTerm { password: b"pw" });

        // Flip one byte inside the USERNAME value.
        let username_value_offset = 20 + 4;
        datagram[username_value_offset] ^= 0xFF;

        let msg = read(&datagram).unwrap();
        assert!(msg.has_integrity());
        assert!(!msg.check_integrity(&IntegrityKey::ShortTerm(b"pw".to_vec())));
    }

    #[test]
    fn bad_fingerprint_is_rejected_at_parse_time() {
        let tid = TransactionId::random();
        let builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        let mut datagram = builder.finish(Auth::None);
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;

        assert_eq!(read(&datagram), Err(StunError::BadFingerprint));
    }

    #[test]
    fn unknown_required_attribute_is_rejected() {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        builder.append(0x0002, b"legacy"); // SHARED-SECRET, reserved/unused, required range
        let datagram = builder.finish(Auth::None);

        assert_eq!(read(&datagram), Err(StunError::UnknownRequiredAttribute(0x0002)));
    }

    #[test]
    fn unknown_optional_attribute_is_skipped() {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        builder.append(0x8999, b"vendor"); // comprehension-optional, unrecognized
        builder.add_username("still-here");
        let datagram = builder.finish(Auth::None);

        let msg = read(&datagram).unwrap();
        assert_eq!(msg.username(), Some("still-here"));
    }

    #[test]
    fn long_term_sha256_integrity_roundtrip() {
        let key = integrity::long_term_key_sha256("user", "example.org", "pw");
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::ALLOCATE, tid);
        builder.add_username("user").add_realm("example.org").add_nonce("abc");
        let datagram = builder.finish(Auth::LongTermSha256 { key });

        let msg = read(&datagram).unwrap();
        assert!(msg.check_integrity(&IntegrityKey::LongTermSha256(key)));
    }
}
