//! Capability traits for a multiplexable secure connection.
//!
//! The tunnel core never speaks SSH itself. It is handed a [`Dialer`] that
//! turns a host alias into a [`RemoteSession`], and everything it needs from
//! the remote side goes through that session.

use anyhow::Result;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use std::any::Any;
use std::sync::Arc;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A byte stream to a remote endpoint, opened over a pooled connection.
///
/// Reading and writing halves are kept apart so the forwarder can copy both
/// directions concurrently. `guard` holds whatever keeps the stream open
/// (a child process, a channel handle) and is dropped together with it.
pub struct RemoteStream {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    pub(crate) guard: Option<Box<dyn Any + Send>>,
}

impl RemoteStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: None,
        }
    }

    /// Keep `guard` alive for as long as the stream is in use.
    pub fn with_guard(mut self, guard: impl Any + Send) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }
}

/// A connected session to one remote host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Open a new stream to `host:port` as seen from the remote side.
    async fn open_stream(&self, host: &str, port: u16) -> Result<RemoteStream>;

    /// Run a one-shot command and return its captured standard output.
    async fn exec(&self, command: &str) -> Result<String>;

    /// Probe the connection. An error means it should be considered dead.
    async fn keepalive(&self) -> Result<()>;

    /// Resolve once the underlying connection has terminated.
    async fn closed(&self);

    /// Tear the connection down and wait for it to finish.
    async fn close(&self);
}

/// Establishes sessions from host aliases. Credential and config resolution
/// happen entirely inside the implementation.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str) -> Result<Arc<dyn RemoteSession>>;
}
