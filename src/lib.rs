#![deny(unreachable_pub, unsafe_code)]

//! A concurrent ICE agent (RFC 8445) with STUN (RFC 8489) and TURN
//! (RFC 8656) client support.
//!
//! Sans-IO: [`Agent`] owns no socket and no clock. The caller binds its
//! own UDP socket(s), drives gathering with its local addresses, feeds
//! inbound datagrams to [`Agent::receive`], and is told what to send
//! and when to wake up again via [`AgentEvent`] and [`Agent::timeout`].

pub mod address;
pub mod agent;
pub mod candidate;
pub mod config;
pub mod entry;
pub mod error;
pub mod limits;
pub mod pair;
pub mod sdp;
pub mod stun;
pub mod turn;

pub use address::AddressRecord;
pub use agent::{Agent, AgentEvent, AgentState, Role};
pub use config::{AgentConfig, TurnServerConfig};
pub use error::{AgentError, StunError};
