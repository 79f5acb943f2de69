//! Timer and bound constants, per spec §6. All durations are in
//! milliseconds.

pub const STUN_KEEPALIVE_PERIOD_MS: u64 = 15_000;
pub const STUN_PACING_TIME_MS: u64 = 50;
pub const PERMISSION_LIFETIME_MS: u64 = 300_000;
pub const BIND_LIFETIME_MS: u64 = 600_000;
pub const TURN_LIFETIME_MS: u64 = 600_000;
pub const TURN_REFRESH_PERIOD_MS: u64 = TURN_LIFETIME_MS / 2;
pub const ICE_FAIL_TIMEOUT_MS: u64 = 30_000;
pub const MIN_STUN_RETRANSMISSION_TIMEOUT_MS: u64 = 500;
pub const MAX_STUN_RETRANSMISSION_COUNT: u32 = 7;

pub const MAX_HOST_CANDIDATES_COUNT: usize = 8;
pub const MAX_PEER_REFLEXIVE_CANDIDATES_COUNT: usize = 8;
pub const ICE_MAX_CANDIDATES_COUNT: usize = 32;
pub const MAX_CANDIDATE_PAIRS_COUNT: usize = 64;
pub const MAX_STUN_ENTRIES_COUNT: usize = 72;
pub const MAX_SERVER_ENTRIES_COUNT: usize = 2;
pub const MAX_RELAY_ENTRIES_COUNT: usize = 2;
pub const STUN_TRANSACTION_ID_SIZE: usize = 12;
pub const STUN_MAX_USERNAME_LEN: usize = 513;
