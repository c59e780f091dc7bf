//! Discovered databases and their tunnel state.

use std::fmt;

/// Composite identity of a tunnel: host alias plus tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    pub host: String,
    pub tenant: String,
}

impl TunnelKey {
    pub fn new(host: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            tenant: tenant.into(),
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.tenant)
    }
}

impl std::str::FromStr for TunnelKey {
    type Err = anyhow::Error;

    /// Parses `host:tenant`.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.split_once(':') {
            Some((host, tenant)) if !host.is_empty() && !tenant.is_empty() => {
                Ok(Self::new(host, tenant))
            }
            _ => anyhow::bail!("expected HOST:TENANT, got {:?}", s),
        }
    }
}

/// Tunnel lifecycle states, as reported to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    /// Discovered, never connected
    Idle,
    /// Connect in progress
    Connecting,
    /// Tunnel is active
    Connected {
        local_addr: String,
        remote_addr: String,
    },
    /// A reconnect attempt after the first one failed
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Connect failed or the tunnel died
    Failed { error: String },
    /// Tunnel was intentionally closed
    Disconnected,
}

impl TunnelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected { .. })
    }

    /// Connected, or on its way there.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting
                | TunnelState::Connected { .. }
                | TunnelState::Reconnecting { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TunnelState::Idle => "Ready",
            TunnelState::Connecting => "Connecting...",
            TunnelState::Connected { .. } => "Connected",
            TunnelState::Reconnecting { .. } => "Reconnecting...",
            TunnelState::Failed { .. } => "Error",
            TunnelState::Disconnected => "Ready",
        }
    }
}

pub const DEFAULT_DB_USER: &str = "postgres";

/// One database discovered behind a remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub env: String,
    /// Host alias as written in the config; part of the tunnel key.
    pub host: String,
    /// Destination handed to ssh (`user@host` when a user is configured).
    pub ssh_host: String,
    /// Remote directory holding one subdirectory per tenant.
    pub root: String,
    pub tenant: String,
    pub db_user: String,
    pub password: String,
    pub database: String,
    pub local_port: u16,
    /// Container address, known once the tunnel has connected.
    pub remote_addr: Option<String>,
    pub state: TunnelState,
}

impl Entry {
    pub fn new(
        env: impl Into<String>,
        host: impl Into<String>,
        ssh_host: impl Into<String>,
        root: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        let tenant = tenant.into();
        Self {
            env: env.into(),
            host: host.into(),
            ssh_host: ssh_host.into(),
            root: root.into(),
            database: tenant.clone(),
            tenant,
            db_user: DEFAULT_DB_USER.to_string(),
            password: String::new(),
            local_port: 0,
            remote_addr: None,
            state: TunnelState::Idle,
        }
    }

    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(&self.host, &self.tenant)
    }

    /// Remote command printing the address of the tenant's `db` container.
    pub fn resolve_command(&self) -> String {
        let dir = format!("{}/{}", self.root.trim_end_matches('/'), self.tenant);
        format!(
            "cd {} && sudo docker compose ps -q db | xargs sudo docker inspect -f '{{{{range .NetworkSettings.Networks}}}}{{{{.IPAddress}}}}{{{{end}}}}'",
            shell_quote(&dir)
        )
    }

    /// `postgresql://` URL for reaching the database through the tunnel.
    pub fn connection_url(&self) -> String {
        format!(
            "postgresql://{}:{}@localhost:{}/{}",
            escape(&self.db_user),
            escape(&self.password),
            self.local_port,
            escape(&self.database)
        )
    }
}

/// Percent-encode everything but `[A-Za-z0-9*-._]`. libpq only decodes
/// `%XX`, so a space must not come out as form encoding's `+`.
fn escape(s: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(s.as_bytes()).collect();
    // A literal '+' is already %2B, so any '+' left stands for a space.
    encoded.replace('+', "%20")
}

/// Quote a string for safe interpolation into a remote shell command.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
