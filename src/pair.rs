//! Candidate pairs and the RFC 8445 §6.1.2.3 priority formula, per
//! spec §3/§4.2.
//!
//! Grounded on `ezk-ice`'s `pair_priority`/`CandidatePairState`
//! (`kbalt-ezk-media/crates/ezk-ice/src/lib.rs`), generalized with the
//! `local == None` sentinel this spec's data model requires for
//! pairing a not-yet-discovered local base against a remote candidate.

use std::cmp::Ordering;

use slotmap::new_key_type;

use crate::candidate::{LocalCandidateId, RemoteCandidateId};

new_key_type! {
    pub struct PairId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Frozen,
    /// Covers both "pending" and "in-progress" from spec §3 — this
    /// crate doesn't distinguish them, matching the data model note
    /// that they're the same state here.
    Pending,
    Succeeded,
    Failed,
}

/// A candidate pair, per spec §3. `local` is `None` until a local base
/// is known for this remote candidate (e.g. before any local relayed
/// candidate of a matching family exists).
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Option<LocalCandidateId>,
    pub remote: RemoteCandidateId,
    pub priority: u64,
    pub state: CandidatePairState,
    pub nominated: bool,
    pub nomination_requested: bool,
    /// Set once the controlling agent has picked this pair to nominate;
    /// the next outgoing check on it carries `USE-CANDIDATE`.
    pub nominate_on_send: bool,
}

impl CandidatePair {
    pub fn new(local: Option<LocalCandidateId>, remote: RemoteCandidateId, priority: u64) -> Self {
        Self {
            local,
            remote,
            priority,
            state: CandidatePairState::Frozen,
            nominated: false,
            nomination_requested: false,
            nominate_on_send: false,
        }
    }
}

/// `compute_pair_priority(local, remote, is_controlling) → u64`, spec
/// §4.2: `priority = 2^32 * min(G,D) + 2 * max(G,D) + (G>D ? 1 : 0)`,
/// where G is the controlling agent's candidate priority and D the
/// controlled agent's.
pub fn compute_pair_priority(local_priority: u32, remote_priority: u32, is_controlling: bool) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    (1u64 << 32) * g.min(d) + 2 * g.max(d) + if g > d { 1 } else { 0 }
}

/// Ordering for `ordered_pairs`: descending priority; among pairs tied
/// on priority with `local == None`, the one with the higher remote
/// candidate priority sorts first (spec §4.2).
pub fn pair_order(a: &CandidatePair, a_remote_priority: u32, b: &CandidatePair, b_remote_priority: u32) -> Ordering {
    match b.priority.cmp(&a.priority) {
        Ordering::Equal if a.local.is_none() && b.local.is_none() => b_remote_priority.cmp(&a_remote_priority),
        other => other,
    }
}
