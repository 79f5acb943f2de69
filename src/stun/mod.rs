//! STUN (RFC 8489) message codec: header framing, attribute table,
//! integrity/fingerprint helpers, and the `Message`/`MessageBuilder`
//! pair that implement spec §4.1's `write`/`read`/`check_integrity`
//! contract.

pub mod attrs;
pub mod integrity;
mod message;

pub use integrity::IntegrityKey;
pub use message::{read, Auth, Message, MessageBuilder};

use rand::distributions::{Alphanumeric, Distribution};
use rand::Rng;

pub const COOKIE: u32 = 0x2112_A442;

/// STUN method codes (RFC 8489 §5, RFC 8656 §7).
pub mod method {
    pub const BINDING: u16 = 0x001;
    pub const ALLOCATE: u16 = 0x003;
    pub const REFRESH: u16 = 0x004;
    pub const SEND: u16 = 0x006;
    pub const DATA: u16 = 0x007;
    pub const CREATE_PERMISSION: u16 = 0x008;
    pub const CHANNEL_BIND: u16 = 0x009;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// The 12-byte transaction id that correlates a request with its
/// response (RFC 8489 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }
}

/// A random alphanumeric credential fragment, used for ICE `ufrag`/`pwd`
/// generation (spec §4.4.1). Length is left to the caller; RFC 8445
/// recommends at least 4 characters for `ufrag` and 22 for `pwd`.
pub fn random_credential(len: usize) -> String {
    let mut rng = rand::thread_rng();
    Alphanumeric.sample_iter(&mut rng).take(len).map(char::from).collect()
}

/// Encode `(method, class)` into the 14-bit STUN message type, per
/// RFC 8489 §5: the class bits are interleaved into the method bits.
pub(crate) fn encode_type(method: u16, class: Class) -> u16 {
    let c = class.bits();
    (method & 0x000F) | ((method & 0x0070) << 1) | ((method & 0x0F80) << 2) | ((c & 0x01) << 4) | ((c & 0x02) << 7)
}

/// Inverse of [`encode_type`].
pub(crate) fn decode_type(type_: u16) -> (u16, Class) {
    let class_bits = ((type_ & 0x0010) >> 4) | ((type_ & 0x0100) >> 7);
    let method = (type_ & 0x000F) | ((type_ & 0x00E0) >> 1) | ((type_ & 0x3E00) >> 2);
    (method, Class::from_bits(class_bits))
}
