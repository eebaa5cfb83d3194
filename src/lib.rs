mod core;
pub mod controller;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod shell;
pub mod transport;
mod test_support;

// Re-export commonly used types for consumers and integration tests
pub use crate::controller::{Controller, ControllerError};
pub use crate::core::identifier::{closest_below, RemoteNode, SwarmId, ID_BYTES, RING_BITS};
pub use crate::core::timings::{Timings, MAX_DATAGRAM, MAX_SEARCH_HOPS};
pub use crate::node::{NodeStatus, VirtualNode};
pub use crate::pool::{NodePool, RoutingError};
pub use crate::shell::Shell;
pub use crate::transport::{RpcError, Transport};

use ctor::ctor;
use tracing_subscriber::{fmt, EnvFilter};

#[ctor]
fn init_tracing() {
    // Avoid duplicate initialization if multiple tests run in parallel
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .try_init();
}
