//! The agent engine: public contract, gathering, TURN allocation,
//! connectivity checks, nomination and ingress dispatch, per spec
//! §4.4.
//!
//! Grounded on `ezk-ice`'s `IceAgent` (`kbalt-ezk-media/crates/ezk-ice/src/lib.rs`):
//! same sans-IO shape (`poll`/`timeout`/`receive`, a caller-driven socket
//! and clock), same `SlotMap`-backed candidate/pair/entry storage,
//! generalized to this spec's single-component model, TURN relay
//! lifecycle and the data model's `local == None` sentinel pairing.

use std::cmp::Ordering as CmpOrdering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::Rng;
use slotmap::SlotMap;

use crate::address::AddressRecord;
use crate::candidate::{self, Candidate, CandidateKind, Description, LocalCandidateId, RemoteCandidateId, COMPONENT};
use crate::config::AgentConfig;
use crate::entry::{EntryKind, EntryState, RetransmitOutcome, StunEntry, StunEntryId};
use crate::error::AgentError;
use crate::limits::*;
use crate::pair::{compute_pair_priority, pair_order, CandidatePair, CandidatePairState, PairId};
use crate::sdp;
use crate::stun::integrity;
use crate::stun::{self, method, Auth, Class, IntegrityKey, Message, MessageBuilder, TransactionId};
use crate::turn::TurnState;

/// Which side of the ICE exchange this agent is playing, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Controlling,
    Controlled,
}

/// Coarse connection state, per spec §3/§4.4.6. Transitions only move
/// forward (`Disconnected < Gathering < Connecting < Connected <
/// Completed`), except for the terminal jump to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Completed,
    Failed,
}

fn state_rank(state: AgentState) -> u8 {
    match state {
        AgentState::Disconnected => 0,
        AgentState::Gathering => 1,
        AgentState::Connecting => 2,
        AgentState::Connected => 3,
        AgentState::Completed => 4,
        AgentState::Failed => 5,
    }
}

/// Everything the caller needs to act on, emitted during
/// `gather_candidates`/`set_remote_description`/`add_remote_candidate`/
/// `send`/`poll`/`receive`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    StateChanged(AgentState),
    GatheringDone,
    /// A new local candidate line, for the caller to forward over
    /// signaling.
    LocalCandidate(String),
    /// A datagram this agent wants sent to `to`. The caller owns the
    /// socket (spec §1's sans-IO boundary); this engine never touches
    /// one directly.
    SendData { to: AddressRecord, data: Vec<u8> },
    /// Application payload that arrived over the selected pair (or its
    /// TURN relay), handed back up to the caller.
    DataReceived(Vec<u8>),
}

/// The agent engine, per spec §3/§4.4. Owns no socket and no clock; the
/// caller drives it with `now_ms` timestamps and feeds it inbound
/// datagrams via [`Agent::receive`].
pub struct Agent {
    config: AgentConfig,
    local: Description,
    remote: Description,
    locals: SlotMap<LocalCandidateId, Candidate>,
    remotes: SlotMap<RemoteCandidateId, Candidate>,
    pairs: SlotMap<PairId, CandidatePair>,
    ordered_pairs: Vec<PairId>,
    entries: SlotMap<StunEntryId, StunEntry>,
    role: Role,
    tiebreaker: u64,
    /// The single non-relayed local base this agent routes through
    /// (spec §9's open question on local pairing, resolved by keeping
    /// exactly one such base per agent).
    local_base: Option<AddressRecord>,
    selected_pair: Option<PairId>,
    selected_entry: Option<StunEntryId>,
    state: AgentState,
    fail_timestamp: Option<u64>,
}

impl Agent {
    /// `create(config) → Agent`, spec §4.4.1.
    pub fn create(config: AgentConfig) -> Self {
        let ufrag = stun::random_credential(8);
        let pwd = stun::random_credential(24);
        let tiebreaker = rand::thread_rng().gen::<u64>();

        Self {
            config,
            local: Description::new(ufrag, pwd),
            remote: Description::default(),
            locals: SlotMap::with_key(),
            remotes: SlotMap::with_key(),
            pairs: SlotMap::with_key(),
            ordered_pairs: Vec::new(),
            entries: SlotMap::with_key(),
            role: Role::Unknown,
            tiebreaker,
            local_base: None,
            selected_pair: None,
            selected_entry: None,
            state: AgentState::Disconnected,
            fail_timestamp: None,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn local_ufrag(&self) -> &str {
        &self.local.ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.local.pwd
    }

    pub fn local_description_sdp(&self) -> String {
        sdp::format_description(&self.local.ufrag, &self.local.pwd, &self.local.candidate_lines())
    }

    /// `gather_candidates(agent) → Result<(), Error>`, spec §4.4.1/§4.4.3.
    /// `local_addrs` are the host addresses the caller's already-bound
    /// socket claims (binding the socket itself is the caller's job,
    /// per spec §1's sans-IO boundary). Idempotent: a second call while
    /// already gathering or beyond is a no-op.
    pub fn gather_candidates(
        &mut self,
        now_ms: u64,
        local_addrs: &[AddressRecord],
        mut on_event: impl FnMut(AgentEvent),
    ) -> Result<(), AgentError> {
        if self.state != AgentState::Disconnected {
            return Ok(());
        }

        self.transition_state(AgentState::Gathering, &mut on_event);

        for addr in local_addrs.iter().take(MAX_HOST_CANDIDATES_COUNT) {
            if self.local_base.is_none() {
                self.local_base = Some(*addr);
            }
            let candidate = candidate::create_local_candidate(CandidateKind::Host, COMPONENT, *addr, *addr);
            let line = candidate.candidate_line();
            if self.local.add_candidate(candidate) {
                on_event(AgentEvent::LocalCandidate(line));
            }
        }

        if self.config.turn_servers.len() > MAX_RELAY_ENTRIES_COUNT {
            log::warn!(
                "{} configured turn_servers exceeds MAX_RELAY_ENTRIES_COUNT ({}); extras dropped",
                self.config.turn_servers.len(),
                MAX_RELAY_ENTRIES_COUNT
            );
        }
        for turn in self.config.turn_servers.clone().into_iter().take(MAX_RELAY_ENTRIES_COUNT) {
            let turn_state = TurnState::new(turn.username, turn.password);
            let entry = StunEntry::new_relay(AddressRecord::new(turn.address), turn_state);
            let id = self.entries.insert(entry);
            self.entries.get_mut(id).unwrap().schedule(now_ms);
            self.arm_pacing(id, now_ms);
        }

        if self.config.stun_servers.len() > MAX_SERVER_ENTRIES_COUNT {
            log::warn!(
                "{} configured stun_servers exceeds MAX_SERVER_ENTRIES_COUNT ({}); extras dropped",
                self.config.stun_servers.len(),
                MAX_SERVER_ENTRIES_COUNT
            );
        }
        for addr in self.config.stun_servers.clone().into_iter().take(MAX_SERVER_ENTRIES_COUNT) {
            let entry = StunEntry::new_server(AddressRecord::new(addr));
            let id = self.entries.insert(entry);
            self.entries.get_mut(id).unwrap().schedule(now_ms);
            self.arm_pacing(id, now_ms);
        }

        self.update_gathering_done(&mut on_event);
        Ok(())
    }

    /// `set_remote_description(agent, sdp)`, spec §4.4.1: reads the
    /// remote ufrag/pwd and any candidates already present in `sdp`.
    pub fn set_remote_description(
        &mut self,
        sdp_text: &str,
        now_ms: u64,
        mut on_event: impl FnMut(AgentEvent),
    ) -> Result<(), AgentError> {
        let ufrag = sdp::extract_ice_ufrag(sdp_text).ok_or(AgentError::MissingCredentials)?;
        let pwd = sdp::extract_ice_pwd(sdp_text).ok_or(AgentError::MissingCredentials)?;
        self.remote.ufrag = ufrag.to_string();
        self.remote.pwd = pwd.to_string();

        if self.role == Role::Unknown {
            // The application is expected to have agreed roles out of
            // band (offerer controls); absent that, default to
            // controlling and let conflict resolution sort it out.
            self.role = Role::Controlling;
        }

        for candidate in sdp::extract_candidates(sdp_text)? {
            self.add_remote_candidate_internal(candidate, now_ms, &mut on_event);
        }
        Ok(())
    }

    /// `add_remote_candidate(agent, line)`, spec §4.4.1.
    pub fn add_remote_candidate(
        &mut self,
        line: &str,
        now_ms: u64,
        mut on_event: impl FnMut(AgentEvent),
    ) -> Result<(), AgentError> {
        if let Some(candidate) = candidate::parse_candidate_sdp(line)? {
            self.add_remote_candidate_internal(candidate, now_ms, &mut on_event);
        }
        Ok(())
    }

    /// `set_remote_gathering_done(agent)`, spec §4.4.1: the fail
    /// watchdog's deadline shortens to "now" once no more remote
    /// candidates are expected.
    pub fn set_remote_gathering_done(&mut self, _now_ms: u64) {
        self.remote.finished = true;
        self.fail_timestamp = None;
    }

    /// `send(agent, data)`, spec §4.4.1: routes over the selected pair,
    /// through its TURN relay if one is in play.
    pub fn send(&mut self, data: &[u8], now_ms: u64, mut on_event: impl FnMut(AgentEvent)) -> Result<(), AgentError> {
        let entry_id = self.selected_entry.ok_or(AgentError::NotConnected)?;
        let Some(pair_id) = self.entries.get(entry_id).and_then(|e| e.pair) else {
            return Err(AgentError::NotConnected);
        };
        let Some(remote_addr) = self.pairs.get(pair_id).and_then(|p| self.remotes.get(p.remote)).map(|c| c.resolved)
        else {
            return Err(AgentError::NotConnected);
        };

        let relay_link = self.entries.get(entry_id).and_then(|e| e.relay_link);

        if let Some(relay_id) = relay_link {
            self.send_via_relay(relay_id, remote_addr, data, now_ms, &mut on_event);
        } else {
            let to = self.translate_destination(remote_addr);
            on_event(AgentEvent::SendData { to, data: data.to_vec() });
        }
        Ok(())
    }

    /// `get_selected_candidate_pair(agent)`, spec §4.4.1.
    pub fn get_selected_candidate_pair(&self) -> Option<(AddressRecord, AddressRecord)> {
        let pid = self.selected_pair?;
        let pair = self.pairs.get(pid)?;
        let remote = self.remotes.get(pair.remote)?.resolved;
        let local = match pair.local {
            Some(id) => self.locals.get(id)?.resolved,
            None => self.local_base?,
        };
        Some((local, remote))
    }

    /// How long the caller may sleep before calling `poll` again.
    pub fn timeout(&self, now_ms: u64) -> u64 {
        let mut next = now_ms + 10_000;
        for entry in self.entries.values() {
            if let Some(t) = entry.next_transmission {
                next = next.min(t.max(now_ms));
            }
        }
        if let Some(fail_at) = self.fail_timestamp {
            next = next.min(fail_at.max(now_ms));
        }
        next.saturating_sub(now_ms)
    }

    /// Drives retransmissions, keepalives and the bookkeeping pass, per
    /// spec §4.4.2/§4.4.6.
    pub fn poll(&mut self, now_ms: u64, mut on_event: impl FnMut(AgentEvent)) {
        let due: Vec<StunEntryId> =
            self.entries.iter().filter(|(_, e)| e.due_for_retransmission(now_ms)).map(|(id, _)| id).collect();

        for id in due {
            if let Some(msg) = self.build_outgoing(id) {
                if let Some(remote) = self.entries.get(id).map(|e| e.remote) {
                    on_event(AgentEvent::SendData { to: remote, data: msg });
                }
            }
            let outcome = self.entries.get_mut(id).map(|e| e.on_retransmission_due(now_ms));
            if matches!(outcome, Some(RetransmitOutcome::Failed)) {
                self.on_entry_failed(id, &mut on_event);
            }
        }

        let keepalive_due: Vec<StunEntryId> =
            self.entries.iter().filter(|(_, e)| e.keepalive_due(now_ms)).map(|(id, _)| id).collect();

        for id in keepalive_due {
            if let Some(msg) = self.build_keepalive(id) {
                if let Some(remote) = self.entries.get(id).map(|e| e.remote) {
                    on_event(AgentEvent::SendData { to: remote, data: msg });
                }
            }
            if let Some(entry) = self.entries.get_mut(id) {
                entry.rearm_keepalive(now_ms);
            }
        }

        self.bookkeeping(now_ms, &mut on_event);
    }

    /// Ingress entry point, per spec §4.4.7: classifies `buf` as a STUN
    /// datagram, ChannelData, or opaque application data and dispatches
    /// accordingly.
    pub fn receive(&mut self, now_ms: u64, source: AddressRecord, buf: &[u8], mut on_event: impl FnMut(AgentEvent)) {
        if is_stun_datagram(buf) {
            self.handle_stun_datagram(now_ms, source, buf, &mut on_event);
        } else if is_channel_data(buf) {
            self.handle_channel_data(now_ms, source, buf, &mut on_event);
        } else {
            self.handle_application_data(source, buf, &mut on_event);
        }
    }

    // ---- internal: pairing -------------------------------------------------

    fn add_remote_candidate_internal(
        &mut self,
        candidate: Candidate,
        now_ms: u64,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let remote_priority = candidate.priority;
        let is_ipv4 = candidate.resolved.is_ipv4();

        if !self.remote.add_candidate(candidate.clone()) {
            return;
        }
        let remote_id = self.remotes.insert(candidate.clone());

        self.create_pair(None, remote_id, remote_priority, candidate.resolved, now_ms, on_event);

        let relayed_locals: Vec<LocalCandidateId> = self
            .locals
            .iter()
            .filter(|(_, c)| c.kind == CandidateKind::Relayed && c.resolved.is_ipv4() == is_ipv4)
            .map(|(id, _)| id)
            .collect();
        for local_id in relayed_locals {
            self.create_pair(Some(local_id), remote_id, remote_priority, candidate.resolved, now_ms, on_event);
        }
    }

    /// Synthesizes a candidate pair and its `Check` entry, per spec
    /// §4.2. A freshly-paired check is scheduled immediately if the
    /// remote ufrag is already known; otherwise it stays `Frozen` until
    /// `set_remote_description` arrives.
    fn create_pair(
        &mut self,
        local: Option<LocalCandidateId>,
        remote_id: RemoteCandidateId,
        remote_priority: u32,
        remote_addr: AddressRecord,
        now_ms: u64,
        on_event: &mut impl FnMut(AgentEvent),
    ) -> Option<PairId> {
        if self.pairs.len() >= self.config.max_pairs.min(MAX_CANDIDATE_PAIRS_COUNT) {
            return None;
        }
        if self.entries.len() >= MAX_STUN_ENTRIES_COUNT {
            return None;
        }

        let local_priority = match local {
            Some(id) => self.locals.get(id).map(|c| c.priority).unwrap_or(0),
            None => self.host_candidate_priority(),
        };
        let priority = compute_pair_priority(local_priority, remote_priority, self.role == Role::Controlling);
        let pair_id = self.pairs.insert(CandidatePair::new(local, remote_id, priority));

        let entry = StunEntry::new_check(pair_id, remote_addr);
        let entry_id = self.entries.insert(entry);

        if !self.remote.ufrag.is_empty() {
            self.pairs[pair_id].state = CandidatePairState::Pending;
            self.entries.get_mut(entry_id).unwrap().schedule(now_ms);
            self.arm_pacing(entry_id, now_ms);
            if state_rank(self.state) < state_rank(AgentState::Connecting) {
                self.transition_state(AgentState::Connecting, on_event);
            }
        }

        self.resort_pairs();
        Some(pair_id)
    }

    /// Finds the pair already paired with a remote candidate at
    /// `source`, or synthesizes a peer-reflexive remote candidate (spec
    /// §4.4.5's "prflx discovery") and pairs it.
    fn find_or_create_remote_pair(
        &mut self,
        source: AddressRecord,
        priority: u32,
        now_ms: u64,
        on_event: &mut impl FnMut(AgentEvent),
    ) -> Option<PairId> {
        let existing_remote_id = self.remotes.iter().find(|(_, c)| c.resolved == source).map(|(id, _)| id);

        let remote_id = match existing_remote_id {
            Some(id) => id,
            None => {
                let base = self.local_base.unwrap_or(source);
                let mut candidate = candidate::create_local_candidate(CandidateKind::PeerReflexive, COMPONENT, source, base);
                // RFC 8445 §7.3.1.3: the peer-reflexive priority is the
                // PRIORITY the request carried, not our own formula.
                candidate.priority = priority;
                if !self.remote.add_candidate(candidate.clone()) {
                    return None;
                }
                self.remotes.insert(candidate)
            }
        };

        if let Some((pid, _)) = self.pairs.iter().find(|(_, p)| p.remote == remote_id && p.local.is_none()) {
            return Some(pid);
        }

        let remote_priority = self.remotes.get(remote_id)?.priority;
        self.create_pair(None, remote_id, remote_priority, source, now_ms, on_event)
    }

    fn recompute_pair_priorities(&mut self) {
        let is_controlling = self.role == Role::Controlling;
        let ids: Vec<PairId> = self.pairs.keys().collect();
        for id in ids {
            let (local_priority, remote_priority) = {
                let pair = &self.pairs[id];
                let local_priority = match pair.local {
                    Some(lid) => self.locals.get(lid).map(|c| c.priority).unwrap_or(0),
                    None => self.host_candidate_priority(),
                };
                let remote_priority = self.remotes.get(pair.remote).map(|c| c.priority).unwrap_or(0);
                (local_priority, remote_priority)
            };
            self.pairs[id].priority = compute_pair_priority(local_priority, remote_priority, is_controlling);
        }
        self.resort_pairs();
    }

    fn resort_pairs(&mut self) {
        let pairs = &self.pairs;
        let remotes = &self.remotes;
        let mut ids: Vec<PairId> = pairs.keys().collect();
        ids.sort_by(|&a, &b| {
            let pa = &pairs[a];
            let pb = &pairs[b];
            let rp_a = remotes.get(pa.remote).map(|c| c.priority).unwrap_or(0);
            let rp_b = remotes.get(pb.remote).map(|c| c.priority).unwrap_or(0);
            pair_order(pa, rp_a, pb, rp_b)
        });
        self.ordered_pairs = ids;
    }

    fn host_candidate_priority(&self) -> u32 {
        self.local.candidates.iter().find(|c| c.kind == CandidateKind::Host).map(|c| c.priority).unwrap_or(0)
    }

    fn find_check_entry(&self, pair_id: PairId) -> Option<StunEntryId> {
        self.entries.iter().find(|(_, e)| e.kind == EntryKind::Check && e.pair == Some(pair_id)).map(|(id, _)| id)
    }

    /// Spaces out an entry's next transmission so no two entries'
    /// *initial* sends land in the same `STUN_PACING_TIME` slot (spec
    /// §4.4.3).
    fn arm_pacing(&mut self, entry_id: StunEntryId, desired_ms: u64) -> u64 {
        let mut candidate = desired_ms;
        loop {
            let taken = self.entries.iter().any(|(id, e)| id != entry_id && e.next_transmission == Some(candidate));
            if !taken {
                if let Some(entry) = self.entries.get_mut(entry_id) {
                    entry.next_transmission = Some(candidate);
                }
                return candidate;
            }
            candidate += STUN_PACING_TIME_MS;
        }
    }

    fn update_gathering_done(&mut self, on_event: &mut impl FnMut(AgentEvent)) {
        let pending = self.entries.values().any(|e| {
            matches!(e.kind, EntryKind::Server | EntryKind::Relay) && matches!(e.state, EntryState::Idle | EntryState::Pending)
        });
        if !pending && !self.local.finished {
            self.local.finished = true;
            on_event(AgentEvent::GatheringDone);
        }
    }

    fn transition_state(&mut self, target: AgentState, on_event: &mut impl FnMut(AgentEvent)) {
        if self.state == target {
            return;
        }
        if target != AgentState::Failed && state_rank(target) <= state_rank(self.state) {
            return;
        }
        self.state = target;
        on_event(AgentEvent::StateChanged(target));
    }

    fn translate_destination(&self, remote: AddressRecord) -> AddressRecord {
        if !self.config.rewrite_loopback {
            return remote;
        }
        let is_local_host =
            self.local.candidates.iter().any(|c| c.kind == CandidateKind::Host && c.resolved.ip() == remote.ip());
        if !is_local_host {
            return remote;
        }
        let loopback = if remote.is_ipv4() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        };
        AddressRecord::new(SocketAddr::new(loopback, remote.port()))
    }

    // ---- internal: bookkeeping pass -----------------------------------------

    fn bookkeeping(&mut self, now_ms: u64, on_event: &mut impl FnMut(AgentEvent)) {
        let selected_pair = self.selected_pair;
        let entry_ids: Vec<StunEntryId> = self.entries.keys().collect();
        for id in &entry_ids {
            let is_selected = selected_pair.is_some() && self.entries[*id].pair == selected_pair;
            let nominated =
                self.entries[*id].pair.and_then(|p| self.pairs.get(p)).is_some_and(|p| p.nominated);
            if !(is_selected && nominated) {
                if let Some(entry) = self.entries.get_mut(*id) {
                    entry.demote_to_keepalive(now_ms);
                }
            }
        }

        let mut nominated_pair = None;
        let mut tentative_pair = None;
        for &pid in &self.ordered_pairs {
            let Some(pair) = self.pairs.get(pid) else { continue };
            if pair.nominated && nominated_pair.is_none() {
                nominated_pair = Some(pid);
            }
            if pair.state == CandidatePairState::Succeeded && !pair.nominated && tentative_pair.is_none() {
                tentative_pair = Some(pid);
            }
        }

        if let Some(pid) = nominated_pair {
            self.selected_pair = Some(pid);
            self.selected_entry = self.find_check_entry(pid);
            self.transition_state(AgentState::Connected, on_event);
            self.transition_state(AgentState::Completed, on_event);
        } else if let Some(pid) = tentative_pair {
            self.selected_pair = Some(pid);
            self.selected_entry = self.find_check_entry(pid);
            self.transition_state(AgentState::Connected, on_event);

            if self.role == Role::Controlling {
                let already_nominating = self.pairs.get(pid).is_some_and(|p| p.nominate_on_send);
                if !already_nominating {
                    if let Some(pair) = self.pairs.get_mut(pid) {
                        pair.nominate_on_send = true;
                    }
                    if let Some(entry_id) = self.find_check_entry(pid) {
                        if let Some(entry) = self.entries.get_mut(entry_id) {
                            entry.schedule(now_ms);
                        }
                    }
                }
            }
        }

        if let Some(best) = nominated_pair.or(tentative_pair) {
            let best_priority = self.pairs.get(best).map(|p| p.priority).unwrap_or(0);
            let lower: Vec<PairId> = self
                .ordered_pairs
                .iter()
                .copied()
                .filter(|&pid| {
                    self.pairs.get(pid).is_some_and(|p| p.priority < best_priority && p.state == CandidatePairState::Pending)
                })
                .collect();
            for pid in lower {
                if let Some(pair) = self.pairs.get_mut(pid) {
                    pair.state = CandidatePairState::Frozen;
                }
                if let Some(entry_id) = self.find_check_entry(pid) {
                    if let Some(entry) = self.entries.get_mut(entry_id) {
                        entry.cancel();
                    }
                }
            }
        }

        let any_in_flight =
            self.pairs.values().any(|p| matches!(p.state, CandidatePairState::Succeeded | CandidatePairState::Pending));
        if !any_in_flight && !matches!(self.state, AgentState::Disconnected | AgentState::Failed) {
            match self.fail_timestamp {
                None => {
                    let deadline = if self.remote.finished { now_ms } else { now_ms + ICE_FAIL_TIMEOUT_MS };
                    self.fail_timestamp = Some(deadline);
                }
                Some(deadline) if now_ms >= deadline => {
                    self.transition_state(AgentState::Failed, on_event);
                }
                _ => {}
            }
        } else {
            self.fail_timestamp = None;
        }
    }

    fn on_entry_failed(&mut self, entry_id: StunEntryId, on_event: &mut impl FnMut(AgentEvent)) {
        let Some(entry) = self.entries.get(entry_id) else { return };
        let kind = entry.kind;
        let pair_id = entry.pair;

        if let Some(pid) = pair_id {
            if let Some(pair) = self.pairs.get_mut(pid) {
                pair.state = CandidatePairState::Failed;
            }
        }
        if matches!(kind, EntryKind::Server | EntryKind::Relay) {
            log::warn!("server/relay STUN entry exhausted its retransmission budget");
            self.update_gathering_done(on_event);
        }
    }

    // ---- internal: outgoing message construction ---------------------------

    fn build_outgoing(&self, entry_id: StunEntryId) -> Option<Vec<u8>> {
        let entry = self.entries.get(entry_id)?;
        match entry.kind {
            EntryKind::Check => self.build_check_request(entry),
            EntryKind::Server => Some(MessageBuilder::new(Class::Request, method::BINDING, entry.transaction_id).finish(Auth::None)),
            EntryKind::Relay => self.build_relay_request(entry),
        }
    }

    fn build_keepalive(&self, entry_id: StunEntryId) -> Option<Vec<u8>> {
        let entry = self.entries.get(entry_id)?;
        match entry.kind {
            EntryKind::Check | EntryKind::Server => {
                Some(MessageBuilder::new(Class::Indication, method::BINDING, TransactionId::random()).finish(Auth::None))
            }
            EntryKind::Relay => self.build_relay_request(entry),
        }
    }

    fn build_check_request(&self, entry: &StunEntry) -> Option<Vec<u8>> {
        let pair_id = entry.pair?;
        let pair = self.pairs.get(pair_id)?;
        let local_priority = match pair.local {
            Some(id) => self.locals.get(id)?.priority,
            None => self.host_candidate_priority(),
        };

        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, entry.transaction_id);
        let username = format!("{}:{}", self.remote.ufrag, self.local.ufrag);
        builder.add_username(&username);
        builder.add_priority(local_priority);
        match self.role {
            Role::Controlling | Role::Unknown => {
                builder.add_ice_controlling(self.tiebreaker);
            }
            Role::Controlled => {
                builder.add_ice_controlled(self.tiebreaker);
            }
        }
        if self.role == Role::Controlling && pair.nominate_on_send {
            builder.add_use_candidate();
        }
        Some(builder.finish(Auth::ShortTerm { password: self.remote.pwd.as_bytes() }))
    }

    fn build_relay_request(&self, entry: &StunEntry) -> Option<Vec<u8>> {
        let turn = entry.turn.as_ref()?;
        let tid = entry.transaction_id;

        if entry.relayed_address.is_none() {
            let mut builder = MessageBuilder::new(Class::Request, method::ALLOCATE, tid);
            builder.add_requested_transport_udp();
            builder.add_dont_fragment();
            builder.add_lifetime((TURN_LIFETIME_MS / 1000) as u32);
            if turn.realm.is_empty() {
                return Some(builder.finish(Auth::None));
            }
            builder.add_username(&turn.username);
            builder.add_realm(&turn.realm);
            builder.add_nonce(&turn.nonce);
            let key = integrity::long_term_key_md5(&turn.username, &turn.realm, &turn.password);
            return Some(builder.finish(Auth::LongTermSha1 { key }));
        }

        let mut builder = MessageBuilder::new(Class::Request, method::REFRESH, tid);
        builder.add_username(&turn.username);
        builder.add_realm(&turn.realm);
        builder.add_nonce(&turn.nonce);
        builder.add_lifetime((TURN_LIFETIME_MS / 1000) as u32);
        let key = integrity::long_term_key_md5(&turn.username, &turn.realm, &turn.password);
        Some(builder.finish(Auth::LongTermSha1 { key }))
    }

    fn send_via_relay(
        &mut self,
        relay_id: StunEntryId,
        peer: AddressRecord,
        data: &[u8],
        now_ms: u64,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let Some(relay_entry) = self.entries.get_mut(relay_id) else { return };
        let relay_remote = relay_entry.remote;
        let Some(turn) = relay_entry.turn.as_mut() else { return };

        if !turn.map.has_permission(&peer, now_ms) {
            let tid = turn.map.set_random_permission_transaction_id(peer);
            let mut builder = MessageBuilder::new(Class::Request, method::CREATE_PERMISSION, tid);
            builder.add_xor_peer_address(peer.socket_addr());
            builder.add_username(&turn.username);
            builder.add_realm(&turn.realm);
            builder.add_nonce(&turn.nonce);
            let key = integrity::long_term_key_md5(&turn.username, &turn.realm, &turn.password);
            let msg = builder.finish(Auth::LongTermSha1 { key });
            on_event(AgentEvent::SendData { to: relay_remote, data: msg });
            // The datagram that triggered this permission request is
            // dropped; a real queue for "send once permission lands" is
            // outside this crate's scope (spec §4.3 doesn't ask for one).
            return;
        }

        if turn.map.channel_needs_rebind(&peer, now_ms) {
            let deadline = now_ms + BIND_LIFETIME_MS;
            let channel = turn.map.bind_random_channel(peer, deadline);
            let tid = turn.map.set_random_channel_bind_transaction_id(peer);
            let mut builder = MessageBuilder::new(Class::Request, method::CHANNEL_BIND, tid);
            builder.add_channel_number(channel);
            builder.add_xor_peer_address(peer.socket_addr());
            builder.add_username(&turn.username);
            builder.add_realm(&turn.realm);
            builder.add_nonce(&turn.nonce);
            let key = integrity::long_term_key_md5(&turn.username, &turn.realm, &turn.password);
            let msg = builder.finish(Auth::LongTermSha1 { key });
            on_event(AgentEvent::SendData { to: relay_remote, data: msg });
        }

        if let Some((channel, true)) = turn.map.get_bound_channel(&peer) {
            let mut framed = Vec::with_capacity(4 + data.len());
            framed.extend_from_slice(&channel.to_be_bytes());
            framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
            framed.extend_from_slice(data);
            let pad = (4 - (data.len() % 4)) % 4;
            framed.extend(std::iter::repeat(0u8).take(pad));
            on_event(AgentEvent::SendData { to: relay_remote, data: framed });
            return;
        }

        // Channel bind outstanding: fall back to a Send Indication so
        // the datagram isn't lost while the bind completes.
        let mut builder = MessageBuilder::new(Class::Indication, method::SEND, TransactionId::random());
        builder.add_xor_peer_address(peer.socket_addr());
        builder.add_data(data);
        builder.add_username(&turn.username);
        builder.add_realm(&turn.realm);
        builder.add_nonce(&turn.nonce);
        let key = integrity::long_term_key_md5(&turn.username, &turn.realm, &turn.password);
        let msg = builder.finish(Auth::LongTermSha1 { key });
        on_event(AgentEvent::SendData { to: relay_remote, data: msg });
    }

    // ---- internal: ingress ---------------------------------------------------

    fn handle_channel_data(
        &mut self,
        now_ms: u64,
        source: AddressRecord,
        buf: &[u8],
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        if buf.len() < 4 {
            return;
        }
        let channel = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return;
        }
        let payload = buf[4..4 + len].to_vec();

        let relay_id = self
            .entries
            .iter()
            .find(|(_, e)| e.kind == EntryKind::Relay && e.remote == source)
            .map(|(id, _)| id);
        let Some(relay_id) = relay_id else { return };
        let peer = self.entries.get(relay_id).and_then(|e| e.turn.as_ref()).and_then(|t| t.map.find_channel(channel));
        let Some(peer) = peer else { return };

        self.receive(now_ms, peer, &payload, on_event);
    }

    fn handle_application_data(&mut self, source: AddressRecord, buf: &[u8], on_event: &mut impl FnMut(AgentEvent)) {
        let from_known_peer = self.entries.values().any(|e| e.kind == EntryKind::Check && e.remote == source);
        if from_known_peer {
            on_event(AgentEvent::DataReceived(buf.to_vec()));
        }
    }

    fn handle_stun_datagram(
        &mut self,
        now_ms: u64,
        source: AddressRecord,
        buf: &[u8],
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let msg = match stun::read(buf) {
            Ok(m) => m,
            Err(err) => {
                log::debug!("dropping malformed STUN datagram from {source}: {err}");
                return;
            }
        };

        match msg.class() {
            Class::Request => self.handle_stun_request(now_ms, source, &msg, on_event),
            Class::Indication => self.handle_stun_indication(now_ms, source, &msg, on_event),
            Class::Success | Class::Error => self.handle_stun_response(now_ms, source, &msg, on_event),
        }
    }

    fn handle_stun_indication(
        &mut self,
        now_ms: u64,
        source: AddressRecord,
        msg: &Message,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let _ = source;
        if msg.method() != method::DATA {
            return; // Binding Indications are unreplied keepalives.
        }
        let Some(data) = msg.data() else { return };
        let Some(Ok(peer)) = msg.xor_peer_address() else { return };
        let data = data.to_vec();
        self.receive(now_ms, AddressRecord::new(peer), &data, on_event);
    }

    fn handle_stun_response(
        &mut self,
        now_ms: u64,
        source: AddressRecord,
        msg: &Message,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let entry_id = self.entries.iter().find(|(_, e)| e.transaction_id == msg.transaction_id()).map(|(id, _)| id);

        if let Some(id) = entry_id {
            match self.entries[id].kind {
                EntryKind::Check => self.handle_check_response(id, now_ms, source, msg, on_event),
                EntryKind::Server => self.handle_server_response(id, now_ms, msg, on_event),
                EntryKind::Relay => self.handle_relay_response(id, now_ms, msg, on_event),
            }
            return;
        }

        self.handle_turn_lazy_response(now_ms, msg);
    }

    fn handle_check_response(
        &mut self,
        entry_id: StunEntryId,
        now_ms: u64,
        source: AddressRecord,
        msg: &Message,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let key = IntegrityKey::ShortTerm(self.remote.pwd.clone().into_bytes());
        if !msg.check_integrity(&key) {
            log::warn!("check response from {source} failed integrity verification");
            if let Some(entry) = self.entries.get_mut(entry_id) {
                entry.on_send_error();
            }
            self.on_entry_failed(entry_id, on_event);
            return;
        }

        if msg.class() == Class::Error {
            let code = msg.error_code().transpose().ok().flatten().map(|e| e.code);
            if code == Some(487) {
                self.handle_role_conflict_response(entry_id, now_ms);
                return;
            }
            if let Some(entry) = self.entries.get_mut(entry_id) {
                entry.on_send_error();
            }
            self.on_entry_failed(entry_id, on_event);
            return;
        }

        let mapped = msg.xor_mapped_address().transpose().ok().flatten();
        if let Some(entry) = self.entries.get_mut(entry_id) {
            entry.on_success();
        }

        let Some(pair_id) = self.entries.get(entry_id).and_then(|e| e.pair) else { return };

        if let Some(mapped_addr) = mapped {
            let mapped_rec = AddressRecord::new(mapped_addr);
            let known = self.local.candidates.iter().any(|c| c.resolved == mapped_rec);
            if !known {
                if let Some(base) = self.local_base {
                    let candidate = candidate::create_local_candidate(CandidateKind::PeerReflexive, COMPONENT, mapped_rec, base);
                    let line = candidate.candidate_line();
                    if self.local.add_candidate(candidate) {
                        on_event(AgentEvent::LocalCandidate(line));
                    }
                }
            }
        }

        if let Some(pair) = self.pairs.get_mut(pair_id) {
            pair.state = CandidatePairState::Succeeded;
            if pair.nomination_requested {
                pair.nominated = true;
            }
        }
        self.resort_pairs();
    }

    fn handle_role_conflict_response(&mut self, entry_id: StunEntryId, now_ms: u64) {
        self.role = match self.role {
            Role::Controlling => Role::Controlled,
            Role::Controlled | Role::Unknown => Role::Controlling,
        };
        self.tiebreaker = rand::thread_rng().gen::<u64>();
        self.recompute_pair_priorities();
        if let Some(entry) = self.entries.get_mut(entry_id) {
            entry.schedule(now_ms);
        }
    }

    fn handle_server_response(
        &mut self,
        entry_id: StunEntryId,
        now_ms: u64,
        msg: &Message,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        if msg.class() == Class::Error {
            if let Some(entry) = self.entries.get_mut(entry_id) {
                entry.on_send_error();
            }
            self.on_entry_failed(entry_id, on_event);
            self.update_gathering_done(on_event);
            return;
        }

        let Some(Ok(mapped)) = msg.xor_mapped_address() else {
            if let Some(entry) = self.entries.get_mut(entry_id) {
                entry.on_send_error();
            }
            self.on_entry_failed(entry_id, on_event);
            self.update_gathering_done(on_event);
            return;
        };

        if let Some(base) = self.local_base {
            let candidate = candidate::create_local_candidate(CandidateKind::ServerReflexive, COMPONENT, AddressRecord::new(mapped), base);
            let line = candidate.candidate_line();
            if self.local.add_candidate(candidate) {
                on_event(AgentEvent::LocalCandidate(line));
            }
        }

        if let Some(entry) = self.entries.get_mut(entry_id) {
            entry.on_success();
            entry.demote_to_keepalive(now_ms);
        }
        self.update_gathering_done(on_event);
    }

    fn handle_relay_response(
        &mut self,
        entry_id: StunEntryId,
        now_ms: u64,
        msg: &Message,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        if msg.class() == Class::Error {
            let code = msg.error_code().transpose().ok().flatten().map(|e| e.code).unwrap_or(0);
            match code {
                401 => {
                    let realm = msg.realm().unwrap_or_default().to_string();
                    let nonce = msg.nonce().unwrap_or_default().to_string();
                    if let Some(entry) = self.entries.get_mut(entry_id) {
                        if let Some(turn) = entry.turn.as_mut() {
                            turn.adopt_challenge(realm, nonce);
                        }
                        entry.schedule(now_ms);
                    }
                }
                438 => {
                    let nonce = msg.nonce().unwrap_or_default().to_string();
                    if let Some(entry) = self.entries.get_mut(entry_id) {
                        if let Some(turn) = entry.turn.as_mut() {
                            turn.nonce = nonce;
                        }
                        entry.schedule(now_ms);
                    }
                }
                _ => {
                    log::warn!("TURN allocation abandoned: server returned error {code}");
                    if let Some(entry) = self.entries.get_mut(entry_id) {
                        entry.on_send_error();
                    }
                    self.on_entry_failed(entry_id, on_event);
                }
            }
            self.update_gathering_done(on_event);
            return;
        }

        let relayed = msg.xor_relayed_address().transpose().ok().flatten();
        let mapped = msg.xor_mapped_address().transpose().ok().flatten();

        if let (Some(relayed), Some(mapped)) = (relayed, mapped) {
            let relayed_rec = AddressRecord::new(relayed);
            if let Some(entry) = self.entries.get_mut(entry_id) {
                entry.relayed_address = Some(relayed_rec);
            }
            let base = self.local_base.unwrap_or(relayed_rec);

            let relay_candidate = candidate::create_local_candidate(CandidateKind::Relayed, COMPONENT, relayed_rec, base);
            let relay_line = relay_candidate.candidate_line();
            if self.local.add_candidate(relay_candidate.clone()) {
                on_event(AgentEvent::LocalCandidate(relay_line));
            }
            let local_id = self.locals.insert(relay_candidate);

            let srflx_candidate = candidate::create_local_candidate(CandidateKind::ServerReflexive, COMPONENT, AddressRecord::new(mapped), base);
            let srflx_line = srflx_candidate.candidate_line();
            if self.local.add_candidate(srflx_candidate) {
                on_event(AgentEvent::LocalCandidate(srflx_line));
            }

            let remotes: Vec<(RemoteCandidateId, u32, AddressRecord)> =
                self.remotes.iter().map(|(id, c)| (id, c.priority, c.resolved)).collect();
            for (remote_id, remote_priority, remote_addr) in remotes {
                self.create_pair(Some(local_id), remote_id, remote_priority, remote_addr, now_ms, on_event);
            }
        }

        if let Some(entry) = self.entries.get_mut(entry_id) {
            entry.on_success();
            entry.demote_to_keepalive(now_ms);
        }
        self.update_gathering_done(on_event);
    }

    /// Matches a `CreatePermission`/`ChannelBind` response against the
    /// lazily-issued transaction ids tracked in each relay entry's
    /// `TurnMap` (spec §4.3: these aren't owned by any `StunEntry`).
    fn handle_turn_lazy_response(&mut self, now_ms: u64, msg: &Message) {
        if msg.class() != Class::Success {
            return;
        }
        let relay_ids: Vec<StunEntryId> = self.entries.iter().filter(|(_, e)| e.kind == EntryKind::Relay).map(|(id, _)| id).collect();
        for relay_id in relay_ids {
            let Some(entry) = self.entries.get_mut(relay_id) else { continue };
            let Some(turn) = entry.turn.as_mut() else { continue };
            if turn.map.set_permission(&msg.transaction_id(), None, PERMISSION_LIFETIME_MS, now_ms).is_some() {
                return;
            }
            if turn.map.bind_current_channel(&msg.transaction_id(), BIND_LIFETIME_MS, now_ms).is_some() {
                return;
            }
        }
    }

    fn handle_stun_request(
        &mut self,
        now_ms: u64,
        source: AddressRecord,
        msg: &Message,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        if msg.method() != method::BINDING {
            return;
        }

        // The peer authenticates to us with USERNAME
        // "{local.ufrag}:{remote.ufrag}" and our own password (spec
        // §4.4.7: "For Binding requests integrity must be present and
        // pass").
        let key = IntegrityKey::ShortTerm(self.local.pwd.clone().into_bytes());
        if !msg.check_integrity(&key) {
            log::warn!("Binding request from {source} failed integrity verification");
            self.send_binding_error(source, msg.transaction_id(), 400, "Bad Request", on_event);
            return;
        }

        let controlling_tb = msg.ice_controlling();
        let controlled_tb = msg.ice_controlled();
        if controlling_tb.is_none() == controlled_tb.is_none() {
            self.send_binding_error(source, msg.transaction_id(), 400, "Bad Request", on_event);
            return;
        }

        let peer_is_controlling = controlling_tb.is_some();
        let role_conflict = (peer_is_controlling && self.role == Role::Controlling)
            || (!peer_is_controlling && self.role == Role::Controlled);

        if role_conflict {
            // Reproduced as-is: the "both controlled" branch compares
            // against `controlling_tb` rather than `controlled_tb`,
            // matching an inherited quirk this crate deliberately keeps
            // rather than "fixes".
            let we_win = if peer_is_controlling {
                self.tiebreaker > controlling_tb.unwrap_or(0)
            } else {
                self.tiebreaker > controlling_tb.unwrap_or(0)
            };

            if we_win {
                self.send_binding_error(source, msg.transaction_id(), 487, "Role Conflict", on_event);
                return;
            }
            self.role = if self.role == Role::Controlling { Role::Controlled } else { Role::Controlling };
            self.recompute_pair_priorities();
        }

        let priority = msg.priority().unwrap_or(0);
        let pair_id = self.find_or_create_remote_pair(source, priority, now_ms, on_event);

        if msg.use_candidate() {
            if let Some(pid) = pair_id {
                if let Some(pair) = self.pairs.get_mut(pid) {
                    if pair.state == CandidatePairState::Succeeded {
                        pair.nominated = true;
                    } else {
                        pair.nomination_requested = true;
                    }
                }
            }
        }

        self.send_binding_success(source, msg.transaction_id(), on_event);
    }

    fn send_binding_success(&mut self, to: AddressRecord, transaction_id: TransactionId, on_event: &mut impl FnMut(AgentEvent)) {
        let mut builder = MessageBuilder::new(Class::Success, method::BINDING, transaction_id);
        builder.add_xor_mapped_address(to.socket_addr());
        let data = builder.finish(Auth::ShortTerm { password: self.local.pwd.as_bytes() });
        on_event(AgentEvent::SendData { to, data });
    }

    fn send_binding_error(
        &mut self,
        to: AddressRecord,
        transaction_id: TransactionId,
        code: u16,
        reason: &str,
        on_event: &mut impl FnMut(AgentEvent),
    ) {
        let mut builder = MessageBuilder::new(Class::Error, method::BINDING, transaction_id);
        builder.add_error_code(code, reason);
        let data = builder.finish(Auth::None);
        on_event(AgentEvent::SendData { to, data });
    }
}

/// A datagram is a STUN message if it's at least 20 bytes, its top two
/// bits are clear, and the magic cookie lines up (RFC 8489 §8 / RFC
/// 7983's demultiplexing rule).
pub fn is_stun_datagram(buf: &[u8]) -> bool {
    buf.len() >= 20 && (buf[0] & 0xC0) == 0 && buf[4..8] == stun::COOKIE.to_be_bytes()
}

/// ChannelData's leading byte falls in `0x40..=0x7F` (RFC 8656 §12.4).
pub fn is_channel_data(buf: &[u8]) -> bool {
    buf.len() >= 4 && (0x40..=0x7F).contains(&buf[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> AddressRecord {
        AddressRecord::new(s.parse().unwrap())
    }

    #[test]
    fn is_stun_datagram_recognizes_header() {
        let tid = TransactionId::random();
        let msg = MessageBuilder::new(Class::Request, method::BINDING, tid).finish(Auth::None);
        assert!(is_stun_datagram(&msg));
        assert!(!is_stun_datagram(b"not stun at all, too short"));
    }

    #[test]
    fn is_channel_data_recognizes_leading_byte() {
        assert!(is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(!is_channel_data(&[0x00, 0x01, 0x00, 0x00])); // STUN range
    }

    #[test]
    fn gather_candidates_emits_host_candidate_and_done() {
        let mut agent = Agent::create(AgentConfig::default());
        let mut events = Vec::new();
        agent
            .gather_candidates(0, &[addr("10.0.0.5:4000")], |e| events.push(e))
            .unwrap();

        assert!(events.iter().any(|e| matches!(e, AgentEvent::LocalCandidate(_))));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::GatheringDone)));
        assert_eq!(agent.state(), AgentState::Gathering);
    }

    #[test]
    fn gather_candidates_is_idempotent() {
        let mut agent = Agent::create(AgentConfig::default());
        agent.gather_candidates(0, &[addr("10.0.0.5:4000")], |_| {}).unwrap();
        let before = agent.local.candidates.len();
        agent.gather_candidates(0, &[addr("10.0.0.6:4001")], |_| {}).unwrap();
        assert_eq!(agent.local.candidates.len(), before);
    }

    #[test]
    fn set_remote_description_pairs_existing_host_candidate() {
        let mut agent = Agent::create(AgentConfig::default());
        agent.gather_candidates(0, &[addr("10.0.0.5:4000")], |_| {}).unwrap();

        let remote_sdp = concat!(
            "a=ice-ufrag:rfrag\r\n",
            "a=ice-pwd:rpwd1234567890123456789\r\n",
            "a=candidate:1 1 UDP 2130706431 203.0.113.9 5000 typ host\r\n",
        );
        agent.set_remote_description(remote_sdp, 0, |_| {}).unwrap();

        assert_eq!(agent.pairs.len(), 1);
        assert_eq!(agent.entries.values().filter(|e| e.kind == EntryKind::Check).count(), 1);
    }

    #[test]
    fn connectivity_check_success_selects_pair() {
        let mut agent = Agent::create(AgentConfig::default());
        agent.gather_candidates(0, &[addr("10.0.0.5:4000")], |_| {}).unwrap();
        let remote_sdp = concat!(
            "a=ice-ufrag:rfrag\r\n",
            "a=ice-pwd:rpwd1234567890123456789\r\n",
            "a=candidate:1 1 UDP 2130706431 203.0.113.9 5000 typ host\r\n",
        );
        agent.set_remote_description(remote_sdp, 0, |_| {}).unwrap();

        let pair_id = *agent.ordered_pairs.first().unwrap();
        let entry_id = agent.find_check_entry(pair_id).unwrap();
        let tid = agent.entries[entry_id].transaction_id;

        let mut builder = MessageBuilder::new(Class::Success, method::BINDING, tid);
        builder.add_xor_mapped_address("10.0.0.5:4000".parse().unwrap());
        let response = builder.finish(Auth::ShortTerm { password: agent.remote.pwd.as_bytes() });

        agent.receive(10, addr("203.0.113.9:5000"), &response, |_| {});
        agent.poll(10, |_| {});

        assert_eq!(agent.pairs[pair_id].state, CandidatePairState::Succeeded);
        assert_eq!(agent.state(), AgentState::Connected);
        assert!(agent.pairs[pair_id].nominate_on_send);
    }

    #[test]
    fn role_conflict_flips_role_when_losing_the_tiebreak() {
        let mut agent = Agent::create(AgentConfig::default());
        agent.role = Role::Controlling;
        agent.tiebreaker = 1;

        let mut events = Vec::new();
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, method::BINDING, tid);
        builder.add_username("whatever").add_ice_controlling(u64::MAX);
        let request = builder.finish(Auth::None);

        agent.receive(0, addr("203.0.113.1:4000"), &request, |e| events.push(e));

        assert_eq!(agent.role, Role::Controlled);
        assert!(events.iter().any(|e| matches!(e, AgentEvent::SendData { .. })));
    }

    #[test]
    fn fail_watchdog_fires_after_timeout_with_no_pairs() {
        let mut agent = Agent::create(AgentConfig::default());
        agent.gather_candidates(0, &[addr("10.0.0.5:4000")], |_| {}).unwrap();
        agent.set_remote_gathering_done(0);
        agent.poll(0, |_| {});
        agent.poll(ICE_FAIL_TIMEOUT_MS, |_| {});
        assert_eq!(agent.state(), AgentState::Failed);
    }

    #[test]
    fn is_channel_data_path_decodes_and_redelivers() {
        let mut agent = Agent::create(AgentConfig::default());
        let relay_remote = addr("198.51.100.1:3478");
        let turn = TurnState::new("u".into(), "p".into());
        let entry = StunEntry::new_relay(relay_remote, turn);
        let entry_id = agent.entries.insert(entry);
        let peer = addr("203.0.113.50:9000");
        agent.entries[entry_id].turn.as_mut().unwrap().map.bind_random_channel(peer, 1_000_000);
        let channel = agent.entries[entry_id].turn.as_ref().unwrap().map.get_channel(&peer).unwrap();

        let mut framed = Vec::new();
        framed.extend_from_slice(&channel.to_be_bytes());
        let payload = b"hi";
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&[0, 0]); // padding to 4-byte boundary

        // The peer must already be a known Check remote for application
        // data to be surfaced.
        let pair_id = agent.pairs.insert(CandidatePair::new(None, agent.remotes.insert(candidate::create_local_candidate(CandidateKind::Host, COMPONENT, peer, peer)), 0));
        agent.entries.insert(StunEntry::new_check(pair_id, peer));

        let mut events = Vec::new();
        agent.receive(0, relay_remote, &framed, |e| events.push(e));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::DataReceived(d) if d == payload)));
    }
}
