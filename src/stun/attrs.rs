//! STUN/TURN/ICE attribute type codes and their wire encodings.
//!
//! Encoding for `(XOR-)MAPPED-ADDRESS`/`(XOR-)PEER-ADDRESS`/`(XOR-)RELAYED-ADDRESS`
//! follows RFC 8489 §14.2; the XOR transform is grounded on
//! `faster-stun`'s `attribute::address` module (`mycrl-turn-rs/stun`).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::TransactionId;
use crate::error::StunError;

macro_rules! attr_kinds {
    ($($name:ident = $val:expr),* $(,)?) => {
        $(pub const $name: u16 = $val;)*
    };
}

attr_kinds! {
    MAPPED_ADDRESS = 0x0001,
    USERNAME = 0x0006,
    MESSAGE_INTEGRITY = 0x0008,
    ERROR_CODE = 0x0009,
    UNKNOWN_ATTRIBUTES = 0x000A,
    CHANNEL_NUMBER = 0x000C,
    LIFETIME = 0x000D,
    XOR_PEER_ADDRESS = 0x0012,
    DATA = 0x0013,
    REALM = 0x0014,
    NONCE = 0x0015,
    XOR_RELAYED_ADDRESS = 0x0016,
    REQUESTED_TRANSPORT = 0x0019,
    DONT_FRAGMENT = 0x001A,
    MESSAGE_INTEGRITY_SHA256 = 0x001C,
    PASSWORD_ALGORITHM = 0x001D,
    USERHASH = 0x001E,
    XOR_MAPPED_ADDRESS = 0x0020,
    PRIORITY = 0x0024,
    USE_CANDIDATE = 0x0025,
    PASSWORD_ALGORITHMS = 0x8002,
    SOFTWARE = 0x8022,
    ALTERNATE_SERVER = 0x8023,
    FINGERPRINT = 0x8028,
    ICE_CONTROLLED = 0x8029,
    ICE_CONTROLLING = 0x802A,
}

/// Every attribute code this codec understands. Anything outside this
/// set in the required range (< 0x8000) makes a message unparsable;
/// outside this set in the optional range it is silently skipped.
pub const KNOWN_ATTRIBUTES: &[u16] = &[
    MAPPED_ADDRESS,
    USERNAME,
    MESSAGE_INTEGRITY,
    ERROR_CODE,
    UNKNOWN_ATTRIBUTES,
    CHANNEL_NUMBER,
    LIFETIME,
    XOR_PEER_ADDRESS,
    DATA,
    REALM,
    NONCE,
    XOR_RELAYED_ADDRESS,
    REQUESTED_TRANSPORT,
    DONT_FRAGMENT,
    MESSAGE_INTEGRITY_SHA256,
    PASSWORD_ALGORITHM,
    USERHASH,
    XOR_MAPPED_ADDRESS,
    PRIORITY,
    USE_CANDIDATE,
    PASSWORD_ALGORITHMS,
    SOFTWARE,
    ALTERNATE_SERVER,
    FINGERPRINT,
    ICE_CONTROLLED,
    ICE_CONTROLLING,
];

pub fn is_required_range(kind: u16) -> bool {
    kind < 0x8000
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;
const COOKIE: u32 = 0x2112_A442;

/// Encode a [`SocketAddr`] as `MAPPED-ADDRESS` (`is_xor = false`) or
/// `XOR-MAPPED-ADDRESS`/`XOR-PEER-ADDRESS`/`XOR-RELAYED-ADDRESS`
/// (`is_xor = true`).
pub fn encode_address(addr: SocketAddr, transaction_id: &TransactionId, is_xor: bool, out: &mut Vec<u8>) {
    let addr = if is_xor { xor_address(addr, transaction_id) } else { addr };

    out.push(0);
    out.push(if addr.is_ipv4() { FAMILY_IPV4 } else { FAMILY_IPV6 });
    out.extend_from_slice(&addr.port().to_be_bytes());

    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
}

pub fn decode_address(
    buf: &[u8],
    transaction_id: &TransactionId,
    is_xor: bool,
) -> Result<SocketAddr, StunError> {
    if buf.len() < 4 {
        return Err(StunError::BadAttributeLength("ADDRESS"));
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);

    let ip = match buf[1] {
        FAMILY_IPV4 => {
            if buf.len() != 8 {
                return Err(StunError::BadAttributeLength("ADDRESS"));
            }
            IpAddr::V4(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]))
        }
        FAMILY_IPV6 => {
            if buf.len() != 20 {
                return Err(StunError::BadAttributeLength("ADDRESS"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::BadAddressFamily),
    };

    let addr = SocketAddr::new(ip, port);
    Ok(if is_xor { xor_address(addr, transaction_id) } else { addr })
}

/// X-Port/X-Address transform from RFC 8489 §14.2. Symmetric: applying
/// it twice returns the original address.
fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (COOKIE >> 16) as u16;

    let ip = match addr.ip() {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            for (i, b) in octets.iter_mut().enumerate() {
                *b ^= (COOKIE >> (24 - i * 8)) as u8;
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            for (i, b) in octets.iter_mut().enumerate().take(4) {
                *b ^= (COOKIE >> (24 - i * 8)) as u8;
            }
            for (i, b) in octets.iter_mut().enumerate().skip(4) {
                *b ^= transaction_id.0[i - 4];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };

    SocketAddr::new(ip, port)
}

/// Parsed `ERROR-CODE` attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u16,
    pub reason: String,
}

pub fn encode_error_code(code: u16, reason: &str, out: &mut Vec<u8>) {
    let class = (code / 100) as u8;
    let number = (code % 100) as u8;
    out.extend_from_slice(&[0, 0, class, number]);
    out.extend_from_slice(reason.as_bytes());
}

pub fn decode_error_code(buf: &[u8]) -> Result<ErrorCode, StunError> {
    if buf.len() < 4 {
        return Err(StunError::BadAttributeLength("ERROR-CODE"));
    }
    let class = buf[2] as u16;
    let number = buf[3] as u16;
    let code = class * 100 + number;
    let reason = String::from_utf8_lossy(&buf[4..]).into_owned();
    Ok(ErrorCode { code, reason })
}

/// Internal pseudo-error-code used to mark a response that failed our
/// own local integrity verification, per spec §4.1: this suppresses a
/// noisy protocol-violation warning while still failing the entry.
pub const STUN_ERROR_INTERNAL_VALIDATION_FAILED: u16 = 0xFFFF;

pub fn decode_unknown_attributes(buf: &[u8]) -> Vec<u16> {
    buf.chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

pub fn encode_unknown_attributes(kinds: &[u16], out: &mut Vec<u8>) {
    for kind in kinds {
        out.extend_from_slice(&kind.to_be_bytes());
    }
}
