use thiserror::Error;

/// STUN codec failures, per spec §4.1. Anything not listed here (bad
/// integrity, unknown optional attribute) is handled in-band and does
/// not produce an `Err`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("buffer shorter than the 20-byte STUN header")]
    HeaderTooShort,

    #[error("magic cookie mismatch")]
    BadMagicCookie,

    #[error("message length header doesn't match buffer length")]
    LengthMismatch,

    #[error("attribute header truncated")]
    TruncatedAttributeHeader,

    #[error("attribute value truncated")]
    TruncatedAttributeValue,

    #[error("required-range attribute {0:#06x} is not understood")]
    UnknownRequiredAttribute(u16),

    #[error("FINGERPRINT attribute missing or invalid")]
    BadFingerprint,

    #[error("attribute {0:?} has the wrong length for its type")]
    BadAttributeLength(&'static str),

    #[error("address family byte is neither IPv4 nor IPv6")]
    BadAddressFamily,
}

/// Errors surfaced from the public [`crate::Agent`] API.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no candidate pair has been selected yet")]
    NotConnected,

    #[error("candidate line could not be parsed: {0}")]
    BadCandidateLine(String),

    #[error("local description is missing ice-ufrag/ice-pwd")]
    MissingCredentials,
}
