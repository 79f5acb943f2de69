//! ICE candidate model: [`Candidate`], [`Description`] and the
//! gathering/parsing/insertion operations of spec §4.2.
//!
//! Grounded on `ezk-ice`'s `CandidateKind`/priority computation
//! (`kbalt-ezk-media/crates/ezk-ice/src/lib.rs`), generalized to this
//! spec's single-component model and string-concatenation foundation
//! (the teacher hashes its foundation instead; this spec's data model
//! asks for a literal "kind tag + base address" concatenation).

use std::fmt;

use slotmap::new_key_type;

use crate::address::AddressRecord;
use crate::error::AgentError;
use crate::limits::{ICE_MAX_CANDIDATES_COUNT, MAX_HOST_CANDIDATES_COUNT, MAX_PEER_REFLEXIVE_CANDIDATES_COUNT};

new_key_type! {
    pub struct LocalCandidateId;
    pub struct RemoteCandidateId;
}

/// This crate only ever runs a single RTP-like component; kept as a
/// field (rather than assumed) so wire-level SDP round-trips unchanged.
pub const COMPONENT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }

    fn sdp_typ(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }

    fn from_sdp_typ(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateKind::Host),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "relay" => Some(CandidateKind::Relayed),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A single ICE candidate, per spec §3.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub component: u8,
    pub foundation: String,
    pub transport_udp: bool,
    pub priority: u32,
    pub resolved: AddressRecord,
    /// Numeric host/service formatting of `resolved`, cached for SDP
    /// output so candidate lines are stable even if `resolved` carries
    /// a scope id or other platform quirk.
    pub host: String,
    pub service: String,
    /// The base this candidate was derived from (itself, for host
    /// candidates), used for foundation grouping and for relayed
    /// candidates' `raddr`/`rport`.
    pub base: AddressRecord,
}

impl Candidate {
    pub(crate) fn candidate_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} UDP {} {} {} typ {}",
            self.foundation, self.component, self.priority, self.host, self.service, self.kind.sdp_typ()
        );
        if self.kind == CandidateKind::ServerReflexive || self.kind == CandidateKind::Relayed {
            line.push_str(&format!(" raddr {} rport {}", self.base.ip(), self.base.port()));
        }
        line
    }
}

/// Local preference component of RFC 8445 §5.1.2.2: IPv6 is preferred
/// over IPv4 when both are available, per spec §3.
fn local_preference(addr: &AddressRecord) -> u16 {
    if addr.is_ipv6() {
        65535
    } else {
        32768
    }
}

/// RFC 8445 §5.1.2.1: `priority = 2^24 * type_pref + 2^8 * local_pref + (256 - component)`.
fn candidate_priority(kind: CandidateKind, local_pref: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) + ((local_pref as u32) << 8) + (256 - component as u32)
}

/// Foundation is the concatenation of the kind tag and the base
/// address, truncated to 32 bytes (spec §3). Candidates sharing kind
/// and base therefore share a foundation, as RFC 8445 requires.
fn compute_foundation(kind: CandidateKind, base: &AddressRecord) -> String {
    let raw = format!("{}{}", kind.tag(), base.ip());
    raw.chars().take(32).collect()
}

/// `create_local_candidate(kind, component, addr) → Candidate`, spec §4.2.
pub fn create_local_candidate(kind: CandidateKind, component: u8, addr: AddressRecord, base: AddressRecord) -> Candidate {
    let priority = candidate_priority(kind, local_preference(&addr), component);
    Candidate {
        kind,
        component,
        foundation: compute_foundation(kind, &base),
        transport_udp: true,
        priority,
        resolved: addr,
        host: addr.ip().to_string(),
        service: addr.port().to_string(),
        base,
    }
}

/// `parse_candidate_sdp(line) → Candidate | ignored | error`, spec §4.2.
/// Non-UDP and non-component-1 lines are ignored, not errors.
pub fn parse_candidate_sdp(line: &str) -> Result<Option<Candidate>, AgentError> {
    let body = line.strip_prefix("a=candidate:").or_else(|| line.strip_prefix("candidate:"));
    let Some(body) = body else {
        return Err(AgentError::BadCandidateLine(line.to_string()));
    };

    let mut fields = body.split_whitespace();
    let bad = || AgentError::BadCandidateLine(line.to_string());

    let foundation = fields.next().ok_or_else(bad)?.to_string();
    let component: u8 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let transport = fields.next().ok_or_else(bad)?;
    let priority: u32 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let host = fields.next().ok_or_else(bad)?;
    let port: u16 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;

    let typ_kw = fields.next().ok_or_else(bad)?;
    if typ_kw != "typ" {
        return Err(bad());
    }
    let typ = fields.next().ok_or_else(bad)?;
    let kind = CandidateKind::from_sdp_typ(typ).ok_or_else(bad)?;

    if !transport.eq_ignore_ascii_case("udp") || component != COMPONENT {
        return Ok(None);
    }

    let ip: std::net::IpAddr = host.parse().map_err(|_| bad())?;
    let resolved = AddressRecord::new(std::net::SocketAddr::new(ip, port));

    let mut base = resolved;
    while let Some(key) = fields.next() {
        match key {
            "raddr" => {
                let raddr: std::net::IpAddr = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
                let rport_kw = fields.next().ok_or_else(bad)?;
                if rport_kw != "rport" {
                    return Err(bad());
                }
                let rport: u16 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
                base = AddressRecord::new(std::net::SocketAddr::new(raddr, rport));
            }
            _ => {
                fields.next();
            }
        }
    }

    Ok(Some(Candidate {
        kind,
        component,
        foundation,
        transport_udp: true,
        priority,
        resolved,
        host: host.to_string(),
        service: port.to_string(),
        base,
    }))
}

/// A local or remote ICE description: credentials plus a priority-sorted
/// candidate list, per spec §3.
#[derive(Debug, Clone, Default)]
pub struct Description {
    pub ufrag: String,
    pub pwd: String,
    pub finished: bool,
    pub candidates: Vec<Candidate>,
}

impl Description {
    pub fn new(ufrag: String, pwd: String) -> Self {
        Self { ufrag, pwd, finished: false, candidates: Vec::new() }
    }

    fn host_count(&self) -> usize {
        self.candidates.iter().filter(|c| c.kind == CandidateKind::Host).count()
    }

    fn peer_reflexive_count(&self) -> usize {
        self.candidates.iter().filter(|c| c.kind == CandidateKind::PeerReflexive).count()
    }

    /// `add_candidate(desc, c)`, spec §4.2: dedups against (resolved
    /// address, kind), enforces per-kind and total caps, keeps the list
    /// sorted by descending priority. Returns `true` if inserted.
    pub fn add_candidate(&mut self, candidate: Candidate) -> bool {
        if self.candidates.iter().any(|c| c.resolved == candidate.resolved && c.kind == candidate.kind) {
            return false;
        }

        if self.candidates.len() >= ICE_MAX_CANDIDATES_COUNT {
            return false;
        }

        match candidate.kind {
            CandidateKind::Host if self.host_count() >= MAX_HOST_CANDIDATES_COUNT => return false,
            CandidateKind::PeerReflexive if self.peer_reflexive_count() >= MAX_PEER_REFLEXIVE_CANDIDATES_COUNT => {
                return false
            }
            _ => {}
        }

        let insert_at = self.candidates.partition_point(|c| c.priority >= candidate.priority);
        self.candidates.insert(insert_at, candidate);
        true
    }

    pub fn candidate_lines(&self) -> Vec<String> {
        self.candidates.iter().map(Candidate::candidate_line).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> AddressRecord {
        AddressRecord::new(s.parse().unwrap())
    }

    #[test]
    fn host_ipv4_priority_matches_rfc_formula() {
        let a = addr("10.0.0.1:4000");
        let c = create_local_candidate(CandidateKind::Host, COMPONENT, a, a);
        let expect = (126u32 << 24) + (32768u32 << 8) + (256 - 1);
        assert_eq!(c.priority, expect);
    }

    #[test]
    fn ipv6_gets_higher_local_preference_than_ipv4() {
        let v4 = addr("10.0.0.1:4000");
        let v6 = addr("[::1]:4000");
        let c4 = create_local_candidate(CandidateKind::Host, COMPONENT, v4, v4);
        let c6 = create_local_candidate(CandidateKind::Host, COMPONENT, v6, v6);
        assert!(c6.priority > c4.priority);
    }

    #[test]
    fn host_and_srflx_sharing_a_base_share_foundation() {
        let base = addr("10.0.0.1:4000");
        let srflx_addr = addr("203.0.113.1:55000");
        let host = create_local_candidate(CandidateKind::Host, COMPONENT, base, base);
        let srflx = create_local_candidate(CandidateKind::ServerReflexive, COMPONENT, srflx_addr, base);
        assert_ne!(host.foundation, srflx.foundation); // different kind tag
        let other_srflx = create_local_candidate(CandidateKind::ServerReflexive, COMPONENT, addr("203.0.113.2:1"), base);
        assert_eq!(srflx.foundation, other_srflx.foundation); // same kind + base
    }

    #[test]
    fn add_candidate_dedups_by_resolved_and_kind() {
        let mut desc = Description::new("ufrag".into(), "pwd".into());
        let a = addr("10.0.0.1:4000");
        assert!(desc.add_candidate(create_local_candidate(CandidateKind::Host, COMPONENT, a, a)));
        assert!(!desc.add_candidate(create_local_candidate(CandidateKind::Host, COMPONENT, a, a)));
        assert_eq!(desc.candidates.len(), 1);
    }

    #[test]
    fn add_candidate_enforces_host_cap() {
        let mut desc = Description::new("ufrag".into(), "pwd".into());
        for i in 0..MAX_HOST_CANDIDATES_COUNT + 2 {
            let a = addr(&format!("10.0.0.{}:4000", i + 1));
            desc.add_candidate(create_local_candidate(CandidateKind::Host, COMPONENT, a, a));
        }
        assert_eq!(desc.host_count(), MAX_HOST_CANDIDATES_COUNT);
    }

    #[test]
    fn candidates_stay_sorted_by_descending_priority() {
        let mut desc = Description::new("ufrag".into(), "pwd".into());
        let low = addr("10.0.0.1:1");
        let high = addr("[::1]:1");
        desc.add_candidate(create_local_candidate(CandidateKind::Host, COMPONENT, low, low));
        desc.add_candidate(create_local_candidate(CandidateKind::Host, COMPONENT, high, high));
        assert!(desc.candidates[0].priority >= desc.candidates[1].priority);
    }

    #[test]
    fn parse_candidate_sdp_ignores_non_udp() {
        let line = "a=candidate:1 1 TCP 2130706431 10.0.0.1 4000 typ host";
        assert_eq!(parse_candidate_sdp(line).unwrap(), None);
    }

    #[test]
    fn parse_candidate_sdp_ignores_non_component_one() {
        let line = "a=candidate:1 2 UDP 2130706431 10.0.0.1 4000 typ host";
        assert_eq!(parse_candidate_sdp(line).unwrap(), None);
    }

    #[test]
    fn parse_candidate_sdp_reads_relay_raddr() {
        let line = "a=candidate:1 1 UDP 16777215 203.0.113.9 50000 typ relay raddr 198.51.100.2 rport 3478";
        let c = parse_candidate_sdp(line).unwrap().unwrap();
        assert_eq!(c.kind, CandidateKind::Relayed);
        assert_eq!(c.base.ip().to_string(), "198.51.100.2");
        assert_eq!(c.base.port(), 3478);
    }

    #[test]
    fn parse_candidate_sdp_rejects_garbage() {
        assert!(parse_candidate_sdp("not a candidate line").is_err());
    }
}
