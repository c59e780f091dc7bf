//! Shared, reference-counted connections, one per host.

use super::signal::{Signal, signal};
use super::with_timeout;
use crate::error::TunnelError;
use crate::ssh::{Dialer, RemoteSession};
use async_lock::Mutex;
use smol::future::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Timing knobs for pooled connections.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on establishing a new connection.
    pub dial_timeout: Duration,
    /// How often an idle connection is probed.
    pub keepalive_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// A reference to a pooled connection, handed out by [`ConnectionPool::acquire`].
///
/// Every lease must be given back with [`ConnectionPool::release`] exactly once.
#[derive(Clone)]
pub struct Lease {
    host: String,
    generation: u64,
    session: Arc<dyn RemoteSession>,
    dead: Signal,
}

impl Lease {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }

    /// Fires when this lease's connection terminates.
    pub fn dead(&self) -> &Signal {
        &self.dead
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("host", &self.host)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct PooledConnection {
    session: Arc<dyn RemoteSession>,
    refs: usize,
    dead: Signal,
    /// Distinguishes a replacement connection from the dead one it replaced.
    generation: u64,
}

impl PooledConnection {
    fn lease(&self, host: &str) -> Lease {
        Lease {
            host: host.to_string(),
            generation: self.generation,
            session: self.session.clone(),
            dead: self.dead.clone(),
        }
    }
}

/// At most one live connection per host, shared by every tunnel to that host.
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,
    config: PoolConfig,
    conns: Mutex<HashMap<String, PooledConnection>>,
    next_generation: AtomicU64,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn Dialer>, config: PoolConfig) -> Self {
        Self {
            dialer,
            config,
            conns: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Get a lease on the host's connection, dialing one if there is no live
    /// connection yet.
    ///
    /// Concurrent callers for a host without a connection all dial; the first
    /// to publish its connection wins and the others close theirs.
    pub async fn acquire(&self, host: &str) -> Result<Lease, TunnelError> {
        {
            let mut conns = self.conns.lock().await;
            if let Some(pc) = conns.get_mut(host) {
                if !pc.dead.is_fired() {
                    pc.refs += 1;
                    tracing::debug!("Reusing connection to {} (refs={})", host, pc.refs);
                    return Ok(pc.lease(host));
                }
                tracing::debug!("Dropping dead connection to {}", host);
                conns.remove(host);
            }
        }

        let session = self.dial(host).await?;

        let (dead_tx, dead) = signal();
        {
            let session = session.clone();
            let host = host.to_string();
            smol::spawn(async move {
                session.closed().await;
                tracing::debug!("Connection to {} ended", host);
                dead_tx.fire();
            })
            .detach();
        }
        smol::spawn(keepalive(
            host.to_string(),
            session.clone(),
            dead.clone(),
            self.config.keepalive_interval,
        ))
        .detach();

        let mut conns = self.conns.lock().await;
        if let Some(pc) = conns.get_mut(host) {
            if !pc.dead.is_fired() {
                // Somebody else won the race; use theirs and discard ours.
                pc.refs += 1;
                let lease = pc.lease(host);
                drop(conns);
                tracing::debug!("Discarding duplicate connection to {}", host);
                session.close().await;
                return Ok(lease);
            }
        }

        let pc = PooledConnection {
            session,
            refs: 1,
            dead,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        let lease = pc.lease(host);
        conns.insert(host.to_string(), pc);
        Ok(lease)
    }

    async fn dial(&self, host: &str) -> Result<Arc<dyn RemoteSession>, TunnelError> {
        let timeout = self.config.dial_timeout;
        match with_timeout(timeout, self.dialer.dial(host)).await {
            Some(Ok(session)) => Ok(session),
            Some(Err(e)) => {
                tracing::warn!("Failed to connect to {}: {:#}", host, e);
                Err(TunnelError::Connect {
                    host: host.to_string(),
                    reason: format!("{:#}", e),
                })
            }
            None => {
                tracing::warn!("Connecting to {} timed out after {:?}", host, timeout);
                Err(TunnelError::Connect {
                    host: host.to_string(),
                    reason: format!("timed out after {}s", timeout.as_secs()),
                })
            }
        }
    }

    /// Give a lease back. The connection is closed once nothing holds it.
    ///
    /// A lease on a connection that has since been replaced or force-closed
    /// is ignored.
    pub async fn release(&self, lease: &Lease) {
        let closing = {
            let mut conns = self.conns.lock().await;
            match conns.get_mut(&lease.host) {
                Some(pc) if pc.generation == lease.generation => {
                    pc.refs = pc.refs.saturating_sub(1);
                    tracing::debug!("Released connection to {} (refs={})", lease.host, pc.refs);
                    if pc.refs == 0 {
                        conns.remove(&lease.host).map(|pc| pc.session)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(session) = closing {
            tracing::info!("Closing idle connection to {}", lease.host);
            session.close().await;
        }
    }

    /// The host's liveness signal, or an already-fired one if the pool holds
    /// no connection for it.
    pub async fn dead(&self, host: &str) -> Signal {
        let conns = self.conns.lock().await;
        conns
            .get(host)
            .map(|pc| pc.dead.clone())
            .unwrap_or_else(Signal::fired)
    }

    /// Close every connection regardless of outstanding leases.
    pub async fn close_all(&self) {
        let drained: Vec<(String, PooledConnection)> = {
            let mut conns = self.conns.lock().await;
            conns.drain().collect()
        };

        for (host, pc) in drained {
            tracing::debug!("Force-closing connection to {} (refs={})", host, pc.refs);
            pc.session.close().await;
        }
    }

    /// Outstanding leases on the host's connection, if there is one.
    pub async fn ref_count(&self, host: &str) -> Option<usize> {
        self.conns.lock().await.get(host).map(|pc| pc.refs)
    }

    /// Connections currently held, dead or alive.
    pub async fn live_connections(&self) -> usize {
        self.conns.lock().await.len()
    }
}

/// Probe the connection until it dies; a failed probe closes it so that its
/// liveness signal fires.
async fn keepalive(
    host: String,
    session: Arc<dyn RemoteSession>,
    dead: Signal,
    interval: Duration,
) {
    loop {
        let died = async {
            dead.wait().await;
            true
        }
        .or(async {
            smol::Timer::after(interval).await;
            false
        })
        .await;

        if died {
            return;
        }

        if let Err(e) = session.keepalive().await {
            tracing::warn!("Keepalive to {} failed: {:#}", host, e);
            session.close().await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::RemoteStream;
    use crate::tunnel::signal::Trigger;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct StubSession {
        closed_tx: Trigger,
        closed: Signal,
        keepalive_ok: bool,
    }

    impl StubSession {
        fn new(keepalive_ok: bool) -> Self {
            let (closed_tx, closed) = signal();
            Self {
                closed_tx,
                closed,
                keepalive_ok,
            }
        }
    }

    #[async_trait]
    impl RemoteSession for StubSession {
        async fn open_stream(&self, _host: &str, _port: u16) -> Result<RemoteStream> {
            anyhow::bail!("not supported")
        }
        async fn exec(&self, _command: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn keepalive(&self) -> Result<()> {
            if self.keepalive_ok {
                Ok(())
            } else {
                anyhow::bail!("no reply")
            }
        }
        async fn closed(&self) {
            self.closed.wait().await;
        }
        async fn close(&self) {
            self.closed_tx.fire();
        }
    }

    #[derive(Default)]
    struct StubDialer {
        dials: AtomicUsize,
        fail: bool,
        keepalive_fails: bool,
    }

    #[async_trait]
    impl Dialer for StubDialer {
        async fn dial(&self, host: &str) -> Result<Arc<dyn RemoteSession>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("Permission denied (publickey) for {}", host);
            }
            Ok(Arc::new(StubSession::new(!self.keepalive_fails)))
        }
    }

    fn pool(dialer: Arc<StubDialer>) -> ConnectionPool {
        ConnectionPool::new(
            dialer,
            PoolConfig {
                dial_timeout: Duration::from_secs(5),
                keepalive_interval: Duration::from_millis(20),
            },
        )
    }

    #[test]
    fn test_acquire_shares_one_connection_per_host() {
        smol::block_on(async {
            let dialer = Arc::new(StubDialer::default());
            let pool = pool(dialer.clone());

            let a = pool.acquire("db1").await.unwrap();
            let b = pool.acquire("db1").await.unwrap();
            let c = pool.acquire("db2").await.unwrap();

            assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
            assert_eq!(pool.ref_count("db1").await, Some(2));
            assert_eq!(pool.ref_count("db2").await, Some(1));
            assert!(Arc::ptr_eq(a.session(), b.session()));

            pool.release(&a).await;
            assert_eq!(pool.ref_count("db1").await, Some(1));
            assert!(!b.dead().is_fired());

            pool.release(&b).await;
            assert_eq!(pool.ref_count("db1").await, None);
            b.dead().wait().await;

            pool.release(&c).await;
            assert_eq!(pool.live_connections().await, 0);
        });
    }

    #[test]
    fn test_failed_dial_creates_no_entry() {
        smol::block_on(async {
            let dialer = Arc::new(StubDialer {
                fail: true,
                ..Default::default()
            });
            let pool = pool(dialer);

            let err = pool.acquire("db1").await.unwrap_err();
            assert!(matches!(err, TunnelError::Connect { .. }));
            assert!(!err.is_retriable());
            assert_eq!(pool.live_connections().await, 0);
        });
    }

    #[test]
    fn test_dead_for_unknown_host_is_already_fired() {
        smol::block_on(async {
            let pool = pool(Arc::new(StubDialer::default()));
            assert!(pool.dead("nowhere").await.is_fired());
        });
    }

    #[test]
    fn test_failed_keepalive_fires_liveness_signal() {
        smol::block_on(async {
            let dialer = Arc::new(StubDialer {
                keepalive_fails: true,
                ..Default::default()
            });
            let pool = pool(dialer.clone());

            let lease = pool.acquire("db1").await.unwrap();
            pool.dead("db1").await.wait().await;
            assert!(lease.dead().is_fired());

            // A dead connection is replaced, and the stale lease no longer
            // counts against the replacement.
            let fresh = pool.acquire("db1").await.unwrap();
            assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
            pool.release(&lease).await;
            assert_eq!(pool.ref_count("db1").await, Some(1));
            pool.release(&fresh).await;
            assert_eq!(pool.ref_count("db1").await, None);
        });
    }

    #[test]
    fn test_close_all_ignores_refcounts() {
        smol::block_on(async {
            let pool = pool(Arc::new(StubDialer::default()));
            let a = pool.acquire("db1").await.unwrap();
            let _b = pool.acquire("db1").await.unwrap();
            let c = pool.acquire("db2").await.unwrap();

            pool.close_all().await;
            assert_eq!(pool.live_connections().await, 0);
            a.dead().wait().await;
            c.dead().wait().await;

            // Releasing after a forced close is harmless.
            pool.release(&a).await;
            assert_eq!(pool.live_connections().await, 0);
        });
    }

    #[test]
    fn test_racing_acquires_keep_single_connection() {
        smol::block_on(async {
            let dialer = Arc::new(StubDialer::default());
            let pool = Arc::new(pool(dialer.clone()));

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    smol::spawn(async move { pool.acquire("db1").await })
                })
                .collect();

            let mut leases = Vec::new();
            for task in tasks {
                leases.push(task.await.unwrap());
            }

            assert_eq!(pool.live_connections().await, 1);
            assert_eq!(pool.ref_count("db1").await, Some(8));
            let first = leases[0].session().clone();
            assert!(leases.iter().all(|l| Arc::ptr_eq(l.session(), &first)));
            assert!(dialer.dials.load(Ordering::SeqCst) >= 1);
        });
    }
}
