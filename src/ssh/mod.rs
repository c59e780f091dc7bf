//! Secure connections to remote hosts.
//!
//! This module provides:
//! - `Dialer` / `RemoteSession` - the capability the tunnel core consumes
//! - `SystemSshDialer` - OpenSSH ControlMaster backed implementation

mod session;
mod system;

pub use session::{BoxedReader, BoxedWriter, Dialer, RemoteSession, RemoteStream};
pub use system::{SshOptions, SystemSshDialer};
