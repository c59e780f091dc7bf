//! Tunnels: pooled connections, port forwarders and their lifecycle.

mod forward;
mod health;
mod manager;
mod pool;
mod reconnect;
pub mod signal;

pub use forward::{ForwardHandle, PortForwarder, RemoteTarget};
pub use health::{DEFAULT_SWEEP_INTERVAL, HealthSweep, reconnect};
pub use manager::{Connected, DEFAULT_REMOTE_PORT, ManagerConfig, TunnelManager};
pub use pool::{ConnectionPool, Lease, PoolConfig};
pub use reconnect::{ExponentialBackoff, ReconnectPolicy};

use smol::future::FutureExt;
use std::future::Future;
use std::time::Duration;

/// Run `fut` with a deadline; None if the deadline passed first.
pub(crate) async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = T>) -> Option<T> {
    async { Some(fut.await) }
        .or(async {
            smol::Timer::after(timeout).await;
            None
        })
        .await
}
