//! Engine tunables.

use std::time::Duration;

/// Number of proposer tasks in the pool.
pub const PROPOSERS: usize = 10;

/// Cumulative payload bytes after which a proposer stops batching.
pub const MAX_BATCH_SIZE: usize = 0x3fff_ffff;

/// Maximum number of payloads batched into one proposal.
pub const MAX_BATCH_APP_DATA: usize = 201;

/// Largest executed-cursor gap for which the fast-skip heuristic fires.
pub const SKIP_OVER_NUM: u64 = 16_384;

/// How many missing synods a single read/propose round touches.
pub const FIND_MAX: usize = 8;

/// Tunables for one engine instance.
///
/// Defaults mirror the production constants; tests shrink the wait times.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the proposer task pool.
    pub proposers: usize,

    /// Upper bound on cached machine payload bytes before the cache
    /// starts shrinking.
    pub cache_limit: u64,

    /// How long a leaving node lingers after its exit trigger so its
    /// final messages propagate.
    pub terminate_delay: Duration,

    /// How long a recovering node waits for peer snapshots before giving
    /// up and returning to start.
    pub snapshot_wait: Duration,

    /// Detector silence window: a member unheard-of for this long may be
    /// declared dead.
    pub silence_window: Duration,

    /// Resend the current Paxos round if nothing happened for this long.
    pub push_retry: Duration,

    /// Use full three-phase Paxos even for fresh slots.
    pub three_phase: bool,

    /// Send compact `tiny_learn` messages instead of repeating the payload
    /// in every learn.
    pub no_duplicate_payload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proposers: PROPOSERS,
            cache_limit: 1_000_000_000,
            terminate_delay: Duration::from_secs(3),
            snapshot_wait: Duration::from_secs(60),
            silence_window: Duration::from_secs(4),
            push_retry: Duration::from_secs(3),
            three_phase: false,
            no_duplicate_payload: true,
        }
    }
}

impl EngineConfig {
    /// A config with short waits, suitable for tests.
    pub fn for_tests() -> Self {
        Self {
            terminate_delay: Duration::from_millis(50),
            snapshot_wait: Duration::from_millis(500),
            silence_window: Duration::from_millis(200),
            push_retry: Duration::from_millis(200),
            ..Self::default()
        }
    }
}
