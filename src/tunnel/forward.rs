//! Local port forwarding over a pooled connection.
//!
//! A forwarder owns one loopback listener. Every accepted client gets its own
//! stream to the remote target, opened through the shared session, and a
//! relay task copying bytes both ways until either side hangs up.

use super::signal::{Signal, Trigger, signal};
use crate::error::TunnelError;
use crate::ssh::{RemoteSession, RemoteStream};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use smol::Task;
use smol::future::FutureExt;
use smol::net::{TcpListener, TcpStream};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where forwarded connections go, as seen from the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handle to a running forwarder.
#[derive(Debug, Clone)]
pub struct ForwardHandle {
    local_addr: SocketAddr,
    shutdown: Trigger,
    done: Signal,
}

impl ForwardHandle {
    /// The loopback address clients connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener without waiting for the accept loop to finish.
    pub fn close(&self) {
        self.shutdown.fire();
    }

    /// Close the listener and wait until the accept loop and every relay it
    /// started have ended.
    pub async fn stop(&self) {
        self.close();
        self.done.wait().await;
    }

    /// Fires when the accept loop has ended, for whatever reason.
    pub fn done(&self) -> &Signal {
        &self.done
    }
}

pub struct PortForwarder;

impl PortForwarder {
    /// Bind `127.0.0.1:local_port` and start forwarding to `target`.
    ///
    /// Port 0 binds an ephemeral port; see [`ForwardHandle::local_addr`].
    pub async fn start(
        local_port: u16,
        target: RemoteTarget,
        session: Arc<dyn RemoteSession>,
    ) -> Result<ForwardHandle, TunnelError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
            .await
            .map_err(|e| TunnelError::Listen {
                port: local_port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| TunnelError::Listen {
            port: local_port,
            reason: e.to_string(),
        })?;

        let (shutdown, shutdown_rx) = signal();
        let (done_tx, done) = signal();

        tracing::info!("Forwarding {} -> {}", local_addr, target);
        smol::spawn(accept_loop(
            listener,
            target,
            session,
            shutdown.clone(),
            shutdown_rx,
            done_tx,
        ))
        .detach();

        Ok(ForwardHandle {
            local_addr,
            shutdown,
            done,
        })
    }
}

/// Sleep for `delay`; true if shutdown fired first.
async fn pause_unless_shutdown(delay: Duration, shutdown: &Signal) -> bool {
    async {
        shutdown.wait().await;
        true
    }
    .or(async {
        smol::Timer::after(delay).await;
        false
    })
    .await
}

enum Accepted {
    Client(std::io::Result<(TcpStream, SocketAddr)>),
    Shutdown,
}

async fn accept_loop(
    listener: TcpListener,
    target: RemoteTarget,
    session: Arc<dyn RemoteSession>,
    shutdown: Trigger,
    shutdown_rx: Signal,
    done: Trigger,
) {
    let local_addr = listener.local_addr().ok();
    let mut relays: Vec<Task<()>> = Vec::new();

    loop {
        let accepted = async { Accepted::Client(listener.accept().await) }
            .or(async {
                shutdown_rx.wait().await;
                Accepted::Shutdown
            })
            .await;

        let (client, peer) = match accepted {
            Accepted::Shutdown => break,
            Accepted::Client(Ok(client)) => client,
            Accepted::Client(Err(e)) => {
                tracing::warn!("Accept on {:?} failed: {}", local_addr, e);
                if pause_unless_shutdown(ACCEPT_RETRY_DELAY, &shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        tracing::debug!("Accepted {} on {:?}", peer, local_addr);
        match session.open_stream(&target.host, target.port).await {
            Ok(remote) => {
                relays.retain(|relay| !relay.is_finished());
                relays.push(smol::spawn(relay(client, remote, shutdown_rx.clone())));
            }
            Err(e) => {
                // The pooled connection is no longer usable; stop taking clients.
                tracing::warn!(
                    "Opening stream to {} failed, closing {:?}: {:#}",
                    target,
                    local_addr,
                    e
                );
                shutdown.fire();
                break;
            }
        }
    }

    drop(listener);
    for relay in relays {
        relay.await;
    }
    tracing::debug!("Forwarder on {:?} stopped", local_addr);
    done.fire();
}

/// Copy bytes both ways until one direction ends or the forwarder shuts
/// down, then close both.
async fn relay(client: TcpStream, remote: RemoteStream, shutdown: Signal) {
    let RemoteStream {
        reader: mut remote_reader,
        writer: mut remote_writer,
        guard,
    } = remote;
    let (mut client_reader, mut client_writer) = client.split();

    let upstream = async {
        let result = futures::io::copy(&mut client_reader, &mut remote_writer).await;
        let _ = remote_writer.close().await;
        result
    };
    let downstream = async {
        let result = futures::io::copy(&mut remote_reader, &mut client_writer).await;
        let _ = client_writer.close().await;
        result
    };

    let outcome = async { Some(upstream.or(downstream).await) }
        .or(async {
            shutdown.wait().await;
            None
        })
        .await;

    match outcome {
        Some(Ok(bytes)) => tracing::debug!("Relay finished after {} bytes", bytes),
        Some(Err(e)) => tracing::debug!("Relay ended with error: {}", e),
        None => tracing::debug!("Relay cut by forwarder shutdown"),
    }

    let _ = client_writer.close().await;
    let _ = remote_writer.close().await;
    drop(guard);
}
