//! In-process stand-ins for SSH: sessions whose streams go to a local echo
//! server and whose remote commands print a fixed container address.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use drillbit::entry::{Entry, TunnelKey, TunnelState};
use drillbit::ssh::{Dialer, RemoteSession, RemoteStream};
use drillbit::tunnel::signal::{Signal, Trigger, signal};
use drillbit::tunnel::{ConnectionPool, ManagerConfig, PoolConfig, TunnelManager};
use smol::future::FutureExt;
use smol::net::{TcpListener, TcpStream};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REMOTE_ADDR: &str = "172.18.0.7";

pub struct FakeSession {
    echo: SocketAddr,
    remote_addr: String,
    tenants: String,
    closed_tx: Trigger,
    closed: Signal,
    /// Every `host:port` a stream was opened to
    pub targets: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn open_stream(&self, host: &str, port: u16) -> Result<RemoteStream> {
        if self.closed.is_fired() {
            anyhow::bail!("session closed");
        }
        self.targets
            .lock()
            .unwrap()
            .push(format!("{}:{}", host, port));
        let stream = TcpStream::connect(self.echo).await?;
        Ok(RemoteStream::new(stream.clone(), stream))
    }

    async fn exec(&self, command: &str) -> Result<String> {
        if self.closed.is_fired() {
            anyhow::bail!("session closed");
        }
        if command.starts_with("bash -c") {
            return Ok(self.tenants.clone());
        }
        Ok(format!("{}\n", self.remote_addr))
    }

    async fn keepalive(&self) -> Result<()> {
        if self.closed.is_fired() {
            anyhow::bail!("session closed");
        }
        Ok(())
    }

    async fn closed(&self) {
        self.closed.wait().await;
    }

    async fn close(&self) {
        self.closed_tx.fire();
    }
}

pub struct FakeDialer {
    echo: SocketAddr,
    pub dials: AtomicUsize,
    /// Address printed by the resolve command; empty simulates a stopped db
    pub remote_addr: Mutex<String>,
    /// Output of the discovery script, `name|password` per line
    pub tenants: Mutex<String>,
    /// Fail this many dials with `fail_reason` before succeeding
    pub fail_next: AtomicUsize,
    pub fail_reason: Mutex<String>,
    /// Hosts that always refuse connections
    pub unreachable: Mutex<Vec<String>>,
    sessions: Mutex<Vec<(String, Arc<FakeSession>)>>,
}

impl FakeDialer {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            echo: echo_server().await,
            dials: AtomicUsize::new(0),
            remote_addr: Mutex::new(REMOTE_ADDR.to_string()),
            tenants: Mutex::new(String::new()),
            fail_next: AtomicUsize::new(0),
            fail_reason: Mutex::new(String::new()),
            unreachable: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn fail(&self, times: usize, reason: &str) {
        *self.fail_reason.lock().unwrap() = reason.to_string();
        self.fail_next.store(times, Ordering::SeqCst);
    }

    /// Drop the host's connections as if the network went away.
    pub fn kill(&self, host: &str) {
        for (h, session) in self.sessions.lock().unwrap().iter() {
            if h == host {
                session.closed_tx.fire();
            }
        }
    }

    pub fn sessions(&self, host: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, host: &str) -> Result<Arc<dyn RemoteSession>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().iter().any(|h| h == host) {
            anyhow::bail!("connect to host {} port 22: Connection refused", host);
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("{}: {}", host, self.fail_reason.lock().unwrap());
        }

        let (closed_tx, closed) = signal();
        let session = Arc::new(FakeSession {
            echo: self.echo,
            remote_addr: self.remote_addr.lock().unwrap().clone(),
            tenants: self.tenants.lock().unwrap().clone(),
            closed_tx,
            closed,
            targets: Mutex::new(Vec::new()),
        });
        self.sessions
            .lock()
            .unwrap()
            .push((host.to_string(), session.clone()));
        Ok(session)
    }
}

pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    smol::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            smol::spawn(async move {
                let _ = futures::io::copy(stream.clone(), &mut stream.clone()).await;
            })
            .detach();
        }
    })
    .detach();
    addr
}

pub struct Harness {
    pub dialer: Arc<FakeDialer>,
    pub pool: Arc<ConnectionPool>,
    pub manager: Arc<TunnelManager>,
}

pub async fn harness() -> Harness {
    let dialer = FakeDialer::new().await;
    let pool = Arc::new(ConnectionPool::new(
        dialer.clone(),
        PoolConfig {
            dial_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_millis(50),
        },
    ));
    let manager = Arc::new(TunnelManager::new(pool.clone(), ManagerConfig::default()));
    Harness {
        dialer,
        pool,
        manager,
    }
}

/// An entry on an ephemeral local port.
pub fn entry(host: &str, tenant: &str) -> Entry {
    Entry::new("test", host, host, "/docker", tenant)
}

/// Next notification from the manager, failing the test after 5s.
pub async fn next_event(
    events: &async_channel::Receiver<(TunnelKey, TunnelState)>,
) -> (TunnelKey, TunnelState) {
    let event = async { events.recv().await.ok() }
        .or(async {
            smol::Timer::after(Duration::from_secs(5)).await;
            None
        })
        .await;
    event.expect("no tunnel state within 5s")
}

/// Next state reported for `key`, discarding other keys.
pub async fn next_state(
    events: &async_channel::Receiver<(TunnelKey, TunnelState)>,
    key: &TunnelKey,
) -> TunnelState {
    loop {
        let (k, state) = next_event(events).await;
        if &k == key {
            return state;
        }
    }
}

/// Everything already reported for `key`.
pub fn drain_states(
    events: &async_channel::Receiver<(TunnelKey, TunnelState)>,
    key: &TunnelKey,
) -> Vec<TunnelState> {
    let mut states = Vec::new();
    while let Ok((k, state)) = events.try_recv() {
        if &k == key {
            states.push(state);
        }
    }
    states
}
