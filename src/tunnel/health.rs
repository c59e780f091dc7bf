//! Periodic health sweep and policy-driven reconnects.

use super::manager::{Connected, TunnelManager};
use super::reconnect::ReconnectPolicy;
use crate::entry::{Entry, TunnelState};
use crate::error::TunnelError;
use async_channel::Sender;
use smol::Task;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Ticker telling the coordinator when to look for dropped tunnels.
pub struct HealthSweep;

impl HealthSweep {
    /// Send a tick every `interval` until the receiving side goes away.
    /// Dropping the returned task stops the ticker.
    pub fn spawn(interval: Duration, tx: Sender<()>) -> Task<()> {
        smol::spawn(async move {
            loop {
                smol::Timer::after(interval).await;
                if tx.send(()).await.is_err() {
                    tracing::debug!("Health sweep receiver gone, stopping");
                    break;
                }
            }
        })
    }
}

/// Connect `entry` again, retrying under `policy`.
///
/// Authentication failures and other non-retriable errors end the attempts
/// immediately. A `Reconnecting` state is emitted before every retry.
pub async fn reconnect(
    manager: &Arc<TunnelManager>,
    entry: &Entry,
    policy: &ReconnectPolicy,
) -> Result<Connected, TunnelError> {
    let key = entry.key();
    let mut backoff = policy.backoff();

    loop {
        let e = match manager.connect(entry).await {
            Ok(connected) => return Ok(connected),
            Err(e) => e,
        };
        if !e.is_retriable() {
            tracing::warn!("Not retrying {}: {}", key, e);
            return Err(e);
        }
        let Some(delay) = backoff.next_delay() else {
            return Err(e);
        };

        tracing::info!(
            "Reconnecting {} in {:?} (attempt {}/{})",
            key,
            delay,
            backoff.attempt(),
            backoff.max_attempts()
        );
        manager
            .notify(
                &key,
                TunnelState::Reconnecting {
                    attempt: backoff.attempt(),
                    max_attempts: backoff.max_attempts(),
                },
            )
            .await;
        smol::Timer::after(delay).await;
    }
}
