use tokio::time::Duration;

use super::identifier::RING_BITS;

/// Maximum hops a ring-wide search will take before giving up with the best
/// candidate found so far.
pub const MAX_SEARCH_HOPS: usize = 2 * RING_BITS;

/// One RPC message per UDP datagram; larger payloads are truncated by the
/// sender.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// All time-related settings of a pool, threaded through every component.
///
/// The defaults are production values; tests construct much faster ones so
/// convergence scenarios finish in well under a second per stabilization
/// period.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Pause between stabilization passes of one virtual node. Jittered
    /// ±20% at each sleep.
    pub stabilize_interval: Duration,
    /// How long a single RPC call waits for its response datagram.
    pub rpc_timeout: Duration,
    /// Deadline for `Controller::fetch` as a whole.
    pub fetch_timeout: Duration,
}

impl Timings {
    pub fn new(stabilize_interval: Duration, rpc_timeout: Duration, fetch_timeout: Duration) -> Self {
        Self {
            stabilize_interval,
            rpc_timeout,
            fetch_timeout,
        }
    }

    /// Fast settings for integration tests: scenarios are specified in
    /// multiples of the stabilization interval, so shrinking it bounds the
    /// whole test run.
    pub fn fast() -> Self {
        Self {
            stabilize_interval: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(150),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            stabilize_interval: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}
