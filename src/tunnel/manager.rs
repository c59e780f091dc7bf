//! Tunnel registry and lifecycle orchestration.
//!
//! The manager ties a pooled connection and a forwarder together for every
//! connected entry, watches each tunnel in the background, and reports state
//! changes on a channel instead of touching entry state itself:
//! - `connect` / `disconnect` / `disconnect_all` - user driven lifecycle
//! - a monitor task per tunnel - reports forwarder death and lost connections
//! - `subscribe` - `(TunnelKey, TunnelState)` notifications for the coordinator

use super::forward::{ForwardHandle, PortForwarder, RemoteTarget};
use super::pool::{ConnectionPool, Lease};
use super::with_timeout;
use crate::entry::{Entry, TunnelKey, TunnelState};
use crate::error::TunnelError;
use crate::ssh::RemoteSession;
use async_channel::{Receiver, Sender};
use async_lock::Mutex;
use smol::future::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Port the database listens on inside its container.
pub const DEFAULT_REMOTE_PORT: u16 = 5432;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub remote_port: u16,
    /// Upper bound on the remote address lookup.
    pub resolve_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            remote_port: DEFAULT_REMOTE_PORT,
            resolve_timeout: Duration::from_secs(15),
        }
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connected {
    pub local_addr: SocketAddr,
    pub remote_addr: String,
}

impl Connected {
    fn state(&self) -> TunnelState {
        TunnelState::Connected {
            local_addr: self.local_addr.to_string(),
            remote_addr: self.remote_addr.clone(),
        }
    }
}

struct Tunnel {
    /// Tells this tunnel apart from a later one registered under the same key.
    id: Uuid,
    lease: Lease,
    forwarder: ForwardHandle,
    remote_addr: String,
}

impl Tunnel {
    fn connected(&self) -> Connected {
        Connected {
            local_addr: self.forwarder.local_addr(),
            remote_addr: self.remote_addr.clone(),
        }
    }
}

#[derive(Clone, Copy)]
enum Woke {
    ForwarderDone,
    ConnectionDead,
}

pub struct TunnelManager {
    pool: Arc<ConnectionPool>,
    config: ManagerConfig,
    tunnels: Mutex<HashMap<TunnelKey, Tunnel>>,
    state_tx: Sender<(TunnelKey, TunnelState)>,
    state_rx: Receiver<(TunnelKey, TunnelState)>,
}

impl TunnelManager {
    pub fn new(pool: Arc<ConnectionPool>, config: ManagerConfig) -> Self {
        let (state_tx, state_rx) = async_channel::unbounded();
        Self {
            pool,
            config,
            tunnels: Mutex::new(HashMap::new()),
            state_tx,
            state_rx,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Receiver of tunnel state changes. All receivers share one queue, so
    /// each notification goes to exactly one of them.
    pub fn subscribe(&self) -> Receiver<(TunnelKey, TunnelState)> {
        self.state_rx.clone()
    }

    pub(crate) async fn notify(&self, key: &TunnelKey, state: TunnelState) {
        let _ = self.state_tx.send((key.clone(), state)).await;
    }

    /// Bring up the tunnel for `entry`.
    ///
    /// Acquires the host's pooled connection, resolves the container address
    /// over it, starts forwarding `127.0.0.1:<entry.local_port>` and
    /// registers the tunnel. On any failure the pooled connection is released
    /// again and nothing is registered. Connecting an already connected entry
    /// returns the running tunnel, unless its connection has already died.
    pub async fn connect(self: &Arc<Self>, entry: &Entry) -> Result<Connected, TunnelError> {
        let key = entry.key();

        let (existing, stale) = {
            let mut tunnels = self.tunnels.lock().await;
            if tunnels.get(&key).is_some_and(|t| t.lease.dead().is_fired()) {
                // Its monitor has not caught up with the dead connection yet.
                (None, tunnels.remove(&key))
            } else {
                (tunnels.get(&key).map(Tunnel::connected), None)
            }
        };
        if let Some(tunnel) = stale {
            tracing::debug!("Tunnel {} lost its connection, replacing it", key);
            tunnel.forwarder.stop().await;
            self.pool.release(&tunnel.lease).await;
        }
        if let Some(connected) = existing {
            self.notify(&key, connected.state()).await;
            return Ok(connected);
        }

        self.notify(&key, TunnelState::Connecting).await;
        let result = match self.establish(entry, &key).await {
            // A concurrent connect for the same key got there first.
            Err(e) => match self.connected(&key).await {
                Some(existing) => {
                    tracing::debug!("Tunnel {} connected concurrently ({})", key, e);
                    Ok(existing)
                }
                None => Err(e),
            },
            ok => ok,
        };
        match result {
            Ok(connected) => {
                tracing::info!(
                    "Tunnel {} connected: {} -> {}:{}",
                    key,
                    connected.local_addr,
                    connected.remote_addr,
                    self.config.remote_port
                );
                self.notify(&key, connected.state()).await;
                Ok(connected)
            }
            Err(e) => {
                tracing::warn!("Tunnel {} failed: {}", key, e);
                self.notify(
                    &key,
                    TunnelState::Failed {
                        error: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        entry: &Entry,
        key: &TunnelKey,
    ) -> Result<Connected, TunnelError> {
        let lease = self.pool.acquire(&entry.ssh_host).await?;
        let started = self.start_tunnel(entry, key, &lease).await;
        if started.is_err() {
            self.pool.release(&lease).await;
        }
        started
    }

    async fn start_tunnel(
        self: &Arc<Self>,
        entry: &Entry,
        key: &TunnelKey,
        lease: &Lease,
    ) -> Result<Connected, TunnelError> {
        let remote_addr = self.resolve(entry, key, lease.session()).await?;
        let target = RemoteTarget {
            host: remote_addr.clone(),
            port: self.config.remote_port,
        };
        let forwarder =
            PortForwarder::start(entry.local_port, target, lease.session().clone()).await?;

        let tunnel = Tunnel {
            id: Uuid::new_v4(),
            lease: lease.clone(),
            forwarder: forwarder.clone(),
            remote_addr,
        };
        let connected = tunnel.connected();
        let id = tunnel.id;

        let raced = {
            let mut tunnels = self.tunnels.lock().await;
            if tunnels.contains_key(key) {
                true
            } else {
                tunnels.insert(key.clone(), tunnel);
                false
            }
        };
        if raced {
            forwarder.stop().await;
            return Err(TunnelError::AlreadyConnected {
                key: key.to_string(),
            });
        }

        smol::spawn(self.clone().monitor(key.clone(), id, lease.clone(), forwarder)).detach();
        Ok(connected)
    }

    /// Run the entry's lookup command and take the first non-empty line.
    async fn resolve(
        &self,
        entry: &Entry,
        key: &TunnelKey,
        session: &Arc<dyn RemoteSession>,
    ) -> Result<String, TunnelError> {
        let command = entry.resolve_command();
        tracing::debug!("Resolving {} with: {}", key, command);

        let resolve_error = |reason: String| TunnelError::Resolve {
            key: key.to_string(),
            reason,
        };

        let output = with_timeout(self.config.resolve_timeout, session.exec(&command))
            .await
            .ok_or_else(|| {
                resolve_error(format!(
                    "timed out after {}s",
                    self.config.resolve_timeout.as_secs()
                ))
            })?
            .map_err(|e| resolve_error(format!("{:#}", e)))?;

        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                resolve_error("empty container address, is the db service running?".to_string())
            })
    }

    /// Watch one tunnel until its forwarder ends or its connection dies.
    ///
    /// A tunnel that was already removed by `disconnect` or `disconnect_all`
    /// is not reported: the user asked for it to go away.
    async fn monitor(
        self: Arc<Self>,
        key: TunnelKey,
        id: Uuid,
        lease: Lease,
        forwarder: ForwardHandle,
    ) {
        let woke = async {
            forwarder.done().wait().await;
            Woke::ForwarderDone
        }
        .or(async {
            lease.dead().wait().await;
            Woke::ConnectionDead
        })
        .await;

        if let Woke::ConnectionDead = woke {
            forwarder.stop().await;
        }

        let removed = {
            let mut tunnels = self.tunnels.lock().await;
            match tunnels.get(&key) {
                Some(tunnel) if tunnel.id == id => tunnels.remove(&key),
                _ => None,
            }
        };
        let Some(tunnel) = removed else {
            tracing::debug!("Tunnel {} already removed, nothing to report", key);
            return;
        };

        self.pool.release(&tunnel.lease).await;

        let error = match woke {
            Woke::ConnectionDead => TunnelError::LostConnection {
                host: lease.host().to_string(),
            },
            Woke::ForwarderDone => TunnelError::Forward {
                key: key.to_string(),
                reason: "listener closed".to_string(),
            },
        };
        tracing::warn!("Tunnel {} died: {}", key, error);
        self.notify(
            &key,
            TunnelState::Failed {
                error: error.to_string(),
            },
        )
        .await;
    }

    /// Tear down the tunnel for `key`.
    ///
    /// Disconnecting a key that is not registered, including one its monitor
    /// already reported as failed, does nothing and reports nothing.
    pub async fn disconnect(&self, key: &TunnelKey) {
        let Some(tunnel) = self.tunnels.lock().await.remove(key) else {
            return;
        };
        tunnel.forwarder.stop().await;
        self.pool.release(&tunnel.lease).await;
        tracing::info!("Tunnel {} disconnected", key);
        self.notify(key, TunnelState::Disconnected).await;
    }

    /// Tear down every tunnel and close every pooled connection.
    ///
    /// Returns once all listeners are closed, all forwarders have finished
    /// and the pool is empty.
    pub async fn disconnect_all(&self) {
        let tunnels: Vec<(TunnelKey, Tunnel)> = self.tunnels.lock().await.drain().collect();

        for (_, tunnel) in &tunnels {
            tunnel.forwarder.close();
        }
        futures::future::join_all(tunnels.iter().map(|(_, t)| t.forwarder.done().wait())).await;
        self.pool.close_all().await;

        for (key, _) in &tunnels {
            self.notify(key, TunnelState::Disconnected).await;
        }
        tracing::info!("All tunnels shut down ({} closed)", tunnels.len());
    }

    /// Whether the manager currently holds a tunnel for `key`.
    ///
    /// This is a registry lookup only. It does not probe the local socket or
    /// the remote connection: a tunnel whose connection died a moment ago
    /// stays registered until its monitor has processed the death.
    pub async fn is_registered(&self, key: &TunnelKey) -> bool {
        self.tunnels.lock().await.contains_key(key)
    }

    /// Details of the running tunnel for `key`, if any.
    pub async fn connected(&self, key: &TunnelKey) -> Option<Connected> {
        self.tunnels.lock().await.get(key).map(Tunnel::connected)
    }

    pub async fn active_count(&self) -> usize {
        self.tunnels.lock().await.len()
    }
}
