//! TURN session state: long-term credentials and the per-peer
//! `TurnMap`, per spec §3/§4.3.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::address::AddressRecord;
use crate::stun::TransactionId;

pub const CHANNEL_MIN: u16 = 0x4000;
pub const CHANNEL_MAX: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Permission,
    ChannelBind,
}

/// Per-peer TURN bookkeeping, per spec §4.3.
#[derive(Debug, Clone, Default)]
pub struct PeerEntry {
    pub channel: Option<u16>,
    /// `false` while a `ChannelBind` for `channel` is outstanding.
    pub channel_bound: bool,
    pub channel_lifetime_deadline: Option<u64>,
    pub permission_lifetime_deadline: Option<u64>,
}

/// `TurnMap`, spec §4.3: resolves transaction ids back to the peer they
/// were issued for, and tracks channel/permission lifetimes.
#[derive(Debug, Default)]
pub struct TurnMap {
    peers: HashMap<AddressRecord, PeerEntry>,
    used_channels: HashSet<u16>,
    pending: HashMap<TransactionId, (AddressRecord, PendingOp)>,
}

impl TurnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// `has_permission(peer) → bool`: true iff a permission record
    /// exists and its deadline is still in the future.
    pub fn has_permission(&self, peer: &AddressRecord, now_ms: u64) -> bool {
        self.peers
            .get(peer)
            .and_then(|e| e.permission_lifetime_deadline)
            .is_some_and(|deadline| deadline >= now_ms)
    }

    /// `set_permission(transaction_id, optional peer, lifetime_ms)`:
    /// resolves `peer` by transaction id when not given directly.
    pub fn set_permission(
        &mut self,
        transaction_id: &TransactionId,
        peer: Option<AddressRecord>,
        lifetime_ms: u64,
        now_ms: u64,
    ) -> Option<AddressRecord> {
        let peer = peer.or_else(|| self.resolve_pending(transaction_id, PendingOp::Permission))?;
        self.peers.entry(peer).or_default().permission_lifetime_deadline = Some(now_ms + lifetime_ms);
        Some(peer)
    }

    pub fn get_channel(&self, peer: &AddressRecord) -> Option<u16> {
        self.peers.get(peer).and_then(|e| e.channel)
    }

    pub fn get_bound_channel(&self, peer: &AddressRecord) -> Option<(u16, bool)> {
        self.peers.get(peer).and_then(|e| e.channel.map(|c| (c, e.channel_bound)))
    }

    /// `channel_needs_rebind(peer, now) → bool`: true when `peer` has no
    /// channel yet, or its existing one has passed its lifetime deadline
    /// and must be refreshed transparently (RFC 8656 §11, spec §4.4.4).
    pub fn channel_needs_rebind(&self, peer: &AddressRecord, now_ms: u64) -> bool {
        match self.peers.get(peer).and_then(|e| e.channel_lifetime_deadline) {
            Some(deadline) => deadline <= now_ms,
            None => true,
        }
    }

    /// `bind_random_channel(peer, initial_deadline)`: picks an unused
    /// channel number uniformly from `0x4000..=0x7FFF`, retrying on
    /// collision.
    pub fn bind_random_channel(&mut self, peer: AddressRecord, initial_deadline_ms: u64) -> u16 {
        loop {
            let candidate = rand::thread_rng().gen_range(CHANNEL_MIN..=CHANNEL_MAX);
            if self.used_channels.insert(candidate) {
                let entry = self.peers.entry(peer).or_default();
                entry.channel = Some(candidate);
                entry.channel_bound = false;
                entry.channel_lifetime_deadline = Some(initial_deadline_ms);
                return candidate;
            }
        }
    }

    /// `bind_current_channel(transaction_id, ...)`: promotes a pending
    /// bind into an active one once `ChannelBind` succeeds.
    pub fn bind_current_channel(
        &mut self,
        transaction_id: &TransactionId,
        lifetime_ms: u64,
        now_ms: u64,
    ) -> Option<AddressRecord> {
        let peer = self.resolve_pending(transaction_id, PendingOp::ChannelBind)?;
        let entry = self.peers.get_mut(&peer)?;
        entry.channel_bound = true;
        entry.channel_lifetime_deadline = Some(now_ms + lifetime_ms);
        Some(peer)
    }

    /// `find_channel(channel_number) → peer | none`, for ChannelData ingress.
    pub fn find_channel(&self, channel_number: u16) -> Option<AddressRecord> {
        self.peers.iter().find(|(_, e)| e.channel == Some(channel_number)).map(|(peer, _)| *peer)
    }

    pub fn set_random_permission_transaction_id(&mut self, peer: AddressRecord) -> TransactionId {
        let id = TransactionId::random();
        self.pending.insert(id, (peer, PendingOp::Permission));
        id
    }

    pub fn set_random_channel_bind_transaction_id(&mut self, peer: AddressRecord) -> TransactionId {
        let id = TransactionId::random();
        self.pending.insert(id, (peer, PendingOp::ChannelBind));
        id
    }

    fn resolve_pending(&mut self, transaction_id: &TransactionId, op: PendingOp) -> Option<AddressRecord> {
        let (peer, pending_op) = *self.pending.get(transaction_id)?;
        if pending_op != op {
            return None;
        }
        self.pending.remove(transaction_id);
        Some(peer)
    }
}

/// TURN long-term credential and allocation state owned by a relay
/// entry, per spec §3.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub realm: String,
    pub nonce: String,
    pub username: String,
    pub userhash: Option<[u8; 32]>,
    pub password: String,
    pub map: TurnMap,
}

impl TurnState {
    pub fn new(username: String, password: String) -> Self {
        Self { realm: String::new(), nonce: String::new(), username, userhash: None, password, map: TurnMap::new() }
    }

    pub fn adopt_challenge(&mut self, realm: String, nonce: String) {
        self.realm = realm;
        self.nonce = nonce;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> AddressRecord {
        AddressRecord::new(format!("198.51.100.1:{port}").parse().unwrap())
    }

    #[test]
    fn has_permission_respects_deadline() {
        let mut map = TurnMap::new();
        let p = peer(1);
        let tid = map.set_random_permission_transaction_id(p);
        map.set_permission(&tid, None, 300_000, 1_000);
        assert!(map.has_permission(&p, 1_000));
        assert!(map.has_permission(&p, 301_000));
        assert!(!map.has_permission(&p, 301_001));
    }

    #[test]
    fn bind_random_channel_picks_in_range_and_avoids_collisions() {
        let mut map = TurnMap::new();
        let mut seen = HashSet::new();
        for i in 0..50 {
            let p = peer(i);
            let channel = map.bind_random_channel(p, 0);
            assert!((CHANNEL_MIN..=CHANNEL_MAX).contains(&channel));
            assert!(seen.insert(channel), "channel numbers must not collide");
        }
    }

    #[test]
    fn bind_current_channel_promotes_pending_bind() {
        let mut map = TurnMap::new();
        let p = peer(1);
        map.bind_random_channel(p, 0);
        let tid = map.set_random_channel_bind_transaction_id(p);
        assert_eq!(map.get_bound_channel(&p).unwrap().1, false);
        let resolved = map.bind_current_channel(&tid, 600_000, 10_000).unwrap();
        assert_eq!(resolved, p);
        assert_eq!(map.get_bound_channel(&p).unwrap().1, true);
    }

    #[test]
    fn find_channel_resolves_back_to_peer() {
        let mut map = TurnMap::new();
        let p = peer(7);
        let channel = map.bind_random_channel(p, 0);
        assert_eq!(map.find_channel(channel), Some(p));
        assert_eq!(map.find_channel(channel.wrapping_add(1).max(CHANNEL_MIN)), None);
    }

    #[test]
    fn channel_needs_rebind_once_lifetime_deadline_passes() {
        let mut map = TurnMap::new();
        let p = peer(1);
        assert!(map.channel_needs_rebind(&p, 0), "no channel bound yet");
        map.bind_random_channel(p, 600_000);
        assert!(!map.channel_needs_rebind(&p, 0));
        assert!(!map.channel_needs_rebind(&p, 600_000));
        assert!(map.channel_needs_rebind(&p, 600_001));
    }

    #[test]
    fn resolve_pending_rejects_mismatched_operation() {
        let mut map = TurnMap::new();
        let p = peer(1);
        let tid = map.set_random_permission_transaction_id(p);
        // A ChannelBind response can't consume a Permission transaction id.
        assert_eq!(map.bind_current_channel(&tid, 1, 0), None);
    }
}
