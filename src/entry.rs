//! `StunEntry`: one scheduled STUN transaction context, and its state
//! machine, per spec §3/§4.4.2.

use slotmap::new_key_type;

use crate::address::AddressRecord;
use crate::limits::{MAX_STUN_RETRANSMISSION_COUNT, MIN_STUN_RETRANSMISSION_TIMEOUT_MS, STUN_KEEPALIVE_PERIOD_MS, TURN_REFRESH_PERIOD_MS};
use crate::pair::PairId;
use crate::stun::TransactionId;
use crate::turn::TurnState;

new_key_type! {
    pub struct StunEntryId;
}

/// Retransmission timeout cap. Spec §9 leaves this as an open question
/// ("the source doubles without an explicit cap"); this crate caps at
/// 8 s, matching the sibling `ezk-session` STUN helper's `max_rto`.
pub const RETRANSMISSION_TIMEOUT_CAP_MS: u64 = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Check,
    Server,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Pending,
    Cancelled,
    Failed,
    Succeeded,
    SucceededKeepalive,
}

pub enum RetransmitOutcome {
    Send,
    Failed,
}

/// One scheduled STUN transaction context, per spec §3.
#[derive(Debug)]
pub struct StunEntry {
    pub kind: EntryKind,
    pub state: EntryState,
    /// Owning pair, for `Check` entries.
    pub pair: Option<PairId>,
    /// Owned TURN allocation state, for `Relay` entries.
    pub turn: Option<TurnState>,
    pub remote: AddressRecord,
    /// Local relayed address, once a `Relay` entry's Allocate succeeds.
    pub relayed_address: Option<AddressRecord>,
    /// The relay entry this check is routed through, if any.
    pub relay_link: Option<StunEntryId>,
    pub transaction_id: TransactionId,
    pub next_transmission: Option<u64>,
    pub retransmissions: i32,
    pub retransmission_timeout: u64,
    pub armed: bool,
}

impl StunEntry {
    pub fn new_check(pair: PairId, remote: AddressRecord) -> Self {
        Self::new(EntryKind::Check, remote, Some(pair), None)
    }

    pub fn new_server(remote: AddressRecord) -> Self {
        Self::new(EntryKind::Server, remote, None, None)
    }

    pub fn new_relay(remote: AddressRecord, turn: TurnState) -> Self {
        Self::new(EntryKind::Relay, remote, None, Some(turn))
    }

    fn new(kind: EntryKind, remote: AddressRecord, pair: Option<PairId>, turn: Option<TurnState>) -> Self {
        Self {
            kind,
            state: EntryState::Idle,
            pair,
            turn,
            remote,
            relayed_address: None,
            relay_link: None,
            transaction_id: TransactionId::random(),
            next_transmission: None,
            retransmissions: 0,
            retransmission_timeout: MIN_STUN_RETRANSMISSION_TIMEOUT_MS,
            armed: false,
        }
    }

    /// `idle -[scheduled]-> pending`: the entry is to be sent starting
    /// at `now_ms` (subject to pacing via `Agent::arm_pacing`).
    pub fn schedule(&mut self, now_ms: u64) {
        self.state = EntryState::Pending;
        self.retransmissions = MAX_STUN_RETRANSMISSION_COUNT as i32;
        self.retransmission_timeout = MIN_STUN_RETRANSMISSION_TIMEOUT_MS;
        self.next_transmission = Some(now_ms);
        self.transaction_id = TransactionId::random();
    }

    pub fn due_for_retransmission(&self, now_ms: u64) -> bool {
        self.state == EntryState::Pending && self.next_transmission.is_some_and(|t| t <= now_ms)
    }

    /// `pending -[next_transmission ≤ now]-> pending | failed`: sends
    /// another request if retransmission budget remains, else fails.
    pub fn on_retransmission_due(&mut self, now_ms: u64) -> RetransmitOutcome {
        if self.retransmissions < 0 {
            self.state = EntryState::Failed;
            self.next_transmission = None;
            return RetransmitOutcome::Failed;
        }

        self.retransmissions -= 1;
        self.retransmission_timeout = (self.retransmission_timeout * 2).min(RETRANSMISSION_TIMEOUT_CAP_MS);
        self.next_transmission = Some(now_ms + self.retransmission_timeout);
        RetransmitOutcome::Send
    }

    /// `pending -[send error]-> failed`.
    pub fn on_send_error(&mut self) {
        self.state = EntryState::Failed;
        self.next_transmission = None;
    }

    /// `pending -[matching success response]-> succeeded`.
    pub fn on_success(&mut self) {
        self.state = EntryState::Succeeded;
        self.next_transmission = None;
    }

    /// `succeeded -[not selected-or-not-nominated]-> succeeded-keepalive`.
    ///
    /// `Relay` entries rearm on `TURN_REFRESH_PERIOD_MS` instead of the
    /// regular STUN keepalive cadence (spec §4.4.4: a TURN allocation
    /// must be refreshed at half its lifetime, not kept alive like a
    /// check/server entry).
    pub fn demote_to_keepalive(&mut self, now_ms: u64) {
        if self.state == EntryState::Succeeded {
            self.state = EntryState::SucceededKeepalive;
            self.next_transmission = Some(now_ms + self.keepalive_period_ms());
            self.armed = true;
        }
    }

    pub fn keepalive_due(&self, now_ms: u64) -> bool {
        self.state == EntryState::SucceededKeepalive && self.next_transmission.is_some_and(|t| t <= now_ms)
    }

    /// `succeeded-keepalive -[next_transmission ≤ now]-> succeeded-keepalive`.
    pub fn rearm_keepalive(&mut self, now_ms: u64) {
        self.next_transmission = Some(now_ms + self.keepalive_period_ms());
    }

    fn keepalive_period_ms(&self) -> u64 {
        match self.kind {
            EntryKind::Relay => TURN_REFRESH_PERIOD_MS,
            EntryKind::Check | EntryKind::Server => STUN_KEEPALIVE_PERIOD_MS,
        }
    }

    /// `any -[owning pair frozen or cancelled]-> cancelled`.
    pub fn cancel(&mut self) {
        self.state = EntryState::Cancelled;
        self.next_transmission = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> AddressRecord {
        AddressRecord::new("203.0.113.5:4000".parse().unwrap())
    }

    #[test]
    fn schedule_sets_idle_to_pending_with_defaults() {
        let mut e = StunEntry::new_server(remote());
        e.schedule(100);
        assert_eq!(e.state, EntryState::Pending);
        assert_eq!(e.retransmissions, MAX_STUN_RETRANSMISSION_COUNT as i32);
        assert_eq!(e.retransmission_timeout, MIN_STUN_RETRANSMISSION_TIMEOUT_MS);
        assert_eq!(e.next_transmission, Some(100));
    }

    #[test]
    fn retransmission_doubles_timeout_and_caps_it() {
        let mut e = StunEntry::new_server(remote());
        e.schedule(0);
        let mut timeout = MIN_STUN_RETRANSMISSION_TIMEOUT_MS;
        // 500 -> 1000 -> 2000 -> 4000 -> 8000(capped), well within the 7-retransmission budget.
        for _ in 0..5 {
            assert!(matches!(e.on_retransmission_due(0), RetransmitOutcome::Send));
            timeout = (timeout * 2).min(RETRANSMISSION_TIMEOUT_CAP_MS);
        }
        assert_eq!(e.retransmission_timeout, RETRANSMISSION_TIMEOUT_CAP_MS);
        assert_eq!(timeout, RETRANSMISSION_TIMEOUT_CAP_MS);
    }

    #[test]
    fn exhausting_retransmissions_fails_the_entry() {
        let mut e = StunEntry::new_server(remote());
        e.schedule(0);
        for _ in 0..=MAX_STUN_RETRANSMISSION_COUNT {
            let _ = e.on_retransmission_due(0);
        }
        assert!(matches!(e.on_retransmission_due(0), RetransmitOutcome::Failed));
        assert_eq!(e.state, EntryState::Failed);
        assert_eq!(e.next_transmission, None);
    }

    #[test]
    fn success_clears_pending_schedule() {
        let mut e = StunEntry::new_server(remote());
        e.schedule(0);
        e.on_success();
        assert_eq!(e.state, EntryState::Succeeded);
        assert_eq!(e.next_transmission, None);
    }

    #[test]
    fn demote_to_keepalive_arms_fifteen_second_rearm() {
        let mut e = StunEntry::new_server(remote());
        e.schedule(0);
        e.on_success();
        e.demote_to_keepalive(1_000);
        assert_eq!(e.state, EntryState::SucceededKeepalive);
        assert_eq!(e.next_transmission, Some(1_000 + STUN_KEEPALIVE_PERIOD_MS));
        assert!(e.armed);
    }

    #[test]
    fn cancel_clears_schedule_from_any_state() {
        let mut e = StunEntry::new_server(remote());
        e.schedule(0);
        e.cancel();
        assert_eq!(e.state, EntryState::Cancelled);
        assert_eq!(e.next_transmission, None);
    }

    #[test]
    fn demote_to_keepalive_arms_turn_refresh_period_for_relay_entries() {
        let mut e = StunEntry::new_relay(remote(), crate::turn::TurnState::new(String::new(), String::new()));
        e.schedule(0);
        e.on_success();
        e.demote_to_keepalive(1_000);
        assert_eq!(e.next_transmission, Some(1_000 + TURN_REFRESH_PERIOD_MS));
    }
}
