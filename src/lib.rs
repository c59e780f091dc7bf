//! SSH tunnels to tenant Postgres databases running in docker compose
//! projects on remote hosts.
//!
//! - [`discovery`] lists the databases on every configured host
//! - [`ports`] gives each one a stable local port
//! - [`tunnel`] shares one SSH connection per host across all of its tunnels,
//!   forwards local ports and keeps track of tunnel health
//! - [`state`] is the coordinator's view of every entry

pub mod config;
pub mod discovery;
pub mod entry;
pub mod error;
pub mod ports;
pub mod ssh;
pub mod state;
pub mod tunnel;

pub use entry::{Entry, TunnelKey, TunnelState};
pub use error::TunnelError;
