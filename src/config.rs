//! Agent configuration, per spec §9's "mixed-ownership config strings"
//! note: Rust ownership already gives callers what that note asks a
//! rewrite to have, since `AgentConfig` takes owned `String`s/`Vec`s
//! the caller is free to drop immediately after `Agent::create`.

use std::net::SocketAddr;

/// A configured TURN server and the long-term credentials to use with it.
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    pub address: SocketAddr,
    pub username: String,
    pub password: String,
}

/// Ambient configuration accepted by [`crate::Agent::create`], per
/// SPEC_FULL.md §10.3.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Restrict the local UDP socket to a port range, if the host needs
    /// to coordinate with a firewall policy.
    pub local_port_range: Option<(u16, u16)>,
    /// STUN servers used for server-reflexive gathering. Bounded to
    /// `MAX_SERVER_ENTRIES_COUNT` at gather time; extras are dropped
    /// with a warning.
    pub stun_servers: Vec<SocketAddr>,
    /// TURN servers used for relayed gathering. Bounded to
    /// `MAX_RELAY_ENTRIES_COUNT` at gather time; extras are dropped
    /// with a warning.
    pub turn_servers: Vec<TurnServerConfig>,
    /// Feature gate for spec §4.4.8's loopback rewrite.
    pub rewrite_loopback: bool,
    pub max_pairs: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_port_range: None,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            rewrite_loopback: false,
            max_pairs: crate::limits::MAX_CANDIDATE_PAIRS_COUNT,
        }
    }
}
