//! JSON configuration: hosts to discover, autoconnect list, per-entry
//! overrides and tunnel timings.

use crate::entry::TunnelKey;
use crate::tunnel::{DEFAULT_REMOTE_PORT, ManagerConfig, PoolConfig, ReconnectPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/docker";

/// A remote host to discover databases on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub host: String,
    /// SSH user; the ssh config default when unset
    pub user: Option<String>,
    /// Directory holding one compose project per tenant
    pub root: String,
}

impl HostConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            root: DEFAULT_ROOT.to_string(),
        }
    }

    /// Destination handed to ssh.
    pub fn ssh_host(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Hosts are written either as a bare name or as an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawHost {
    Name(String),
    Full {
        host: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        root: Option<String>,
    },
}

impl TryFrom<RawHost> for HostConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawHost) -> Result<Self> {
        let (host, user, root) = match raw {
            RawHost::Name(host) => (host, None, None),
            RawHost::Full { host, user, root } => (host, user, root),
        };
        if host.trim().is_empty() {
            anyhow::bail!("host entry missing 'host' field");
        }
        Ok(Self {
            host,
            user: user.filter(|u| !u.is_empty()),
            root: root
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_ROOT.to_string()),
        })
    }
}

/// User-edited values for one `host:tenant`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Tunnel timings, all optional in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub remote_port: u16,
    pub keepalive_secs: u64,
    pub sweep_secs: u64,
    pub dial_timeout_secs: u64,
    pub resolve_timeout_secs: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            remote_port: DEFAULT_REMOTE_PORT,
            keepalive_secs: 30,
            sweep_secs: 30,
            dial_timeout_secs: 10,
            resolve_timeout_secs: 15,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl TunnelSettings {
    /// Reject timings that would spin a background loop or break the backoff.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("keepalive_secs", self.keepalive_secs),
            ("sweep_secs", self.sweep_secs),
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("resolve_timeout_secs", self.resolve_timeout_secs),
        ] {
            if value == 0 {
                anyhow::bail!("tunnels.{} must be greater than 0", name);
            }
        }
        let multiplier = self.reconnect.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            anyhow::bail!(
                "tunnels.reconnect.multiplier must be a finite number >= 1, got {}",
                multiplier
            );
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_secs),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            remote_port: self.remote_port,
            resolve_timeout: Duration::from_secs(self.resolve_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            multiplier: self.reconnect.multiplier,
        }
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    environments: BTreeMap<String, Vec<RawHost>>,
    #[serde(default)]
    autoconnect: Vec<Vec<String>>,
    #[serde(default)]
    overrides: HashMap<String, EntryOverride>,
    #[serde(default)]
    tunnels: TunnelSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Environment name to hosts, ordered by name
    pub environments: BTreeMap<String, Vec<HostConfig>>,
    pub autoconnect: Vec<TunnelKey>,
    /// Keyed by `host:tenant`
    pub overrides: HashMap<String, EntryOverride>,
    pub tunnels: TunnelSettings,
}

impl Config {
    /// Parse a config document.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(content).context("Failed to parse config")?;

        if raw.environments.is_empty() {
            anyhow::bail!("config has no environments defined");
        }

        let mut environments = BTreeMap::new();
        for (env, hosts) in raw.environments {
            let hosts = hosts
                .into_iter()
                .map(HostConfig::try_from)
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("environment {:?}", env))?;
            environments.insert(env, hosts);
        }

        let autoconnect = raw
            .autoconnect
            .into_iter()
            .map(|pair| match pair.as_slice() {
                [host, tenant] => Ok(TunnelKey::new(host, tenant)),
                _ => anyhow::bail!("autoconnect entries must be [host, tenant] pairs"),
            })
            .collect::<Result<Vec<_>>>()?;

        raw.tunnels.validate()?;

        Ok(Self {
            environments,
            autoconnect,
            overrides: raw.overrides,
            tunnels: raw.tunnels,
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = smol::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content)
    }

    /// Every configured host with the environment it belongs to.
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostConfig)> {
        self.environments
            .iter()
            .flat_map(|(env, hosts)| hosts.iter().map(move |h| (env.as_str(), h)))
    }

    pub fn override_for(&self, key: &TunnelKey) -> Option<&EntryOverride> {
        self.overrides.get(&key.to_string())
    }
}

/// `~/.config/drillbit/config.json`
pub fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".config").join("drillbit").join("config.json"))
}

const EXAMPLE_CONFIG: &str = r#"{
  "environments": {
    "prod": [
      {"host": "prod-server-1", "user": "deploy", "root": "/docker"},
      "prod-server-2"
    ],
    "test": [
      "test-server-1"
    ]
  },
  "autoconnect": [
    ["test-server-1", "my-app"]
  ],
  "overrides": {
    "prod-server-2:billing": {"user": "billing_ro", "database": "billing"}
  },
  "tunnels": {
    "remote_port": 5432,
    "keepalive_secs": 30,
    "sweep_secs": 30,
    "reconnect": {"max_attempts": 1}
  }
}
"#;

/// Write an example config to `path`, creating its directory.
pub async fn scaffold(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        smol::fs::create_dir_all(parent)
            .await
            .context("Failed to create config directory")?;
    }
    smol::fs::write(path, EXAMPLE_CONFIG)
        .await
        .with_context(|| format!("Failed to write config {}", path.display()))?;
    tracing::info!("Wrote example config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_and_object_hosts() {
        let config = Config::parse(
            r#"{
                "environments": {
                    "prod": [{"host": "db1", "user": "deploy"}, "db2"],
                    "test": [{"host": "db3", "root": "/srv/apps"}]
                }
            }"#,
        )
        .unwrap();

        let hosts: Vec<(&str, &HostConfig)> = config.hosts().collect();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].0, "prod");
        assert_eq!(hosts[0].1.ssh_host(), "deploy@db1");
        assert_eq!(hosts[1].1, &HostConfig::new("db2"));
        assert_eq!(hosts[2].1.root, "/srv/apps");
        assert!(config.autoconnect.is_empty());
        assert_eq!(config.tunnels, TunnelSettings::default());
    }

    #[test]
    fn test_empty_environments_rejected() {
        let err = Config::parse(r#"{"environments": {}}"#).unwrap_err();
        assert!(err.to_string().contains("no environments"));
        assert!(Config::parse("{}").is_err());
    }

    #[test]
    fn test_host_object_without_host_rejected() {
        let err = Config::parse(r#"{"environments": {"prod": [{"host": ""}]}}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("missing 'host'"));
    }

    #[test]
    fn test_autoconnect_pairs() {
        let config = Config::parse(
            r#"{"environments": {"prod": ["db1"]}, "autoconnect": [["db1", "acme"]]}"#,
        )
        .unwrap();
        assert_eq!(config.autoconnect, vec![TunnelKey::new("db1", "acme")]);

        let err = Config::parse(
            r#"{"environments": {"prod": ["db1"]}, "autoconnect": [["db1", "acme", "x"]]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("[host, tenant]"));
    }

    #[test]
    fn test_overrides_and_tunnel_settings() {
        let config = Config::parse(
            r#"{
                "environments": {"prod": ["db1"]},
                "overrides": {"db1:acme": {"password": "s3cret"}},
                "tunnels": {"remote_port": 6432, "reconnect": {"max_attempts": 3}}
            }"#,
        )
        .unwrap();

        let ov = config.override_for(&TunnelKey::new("db1", "acme")).unwrap();
        assert_eq!(ov.password.as_deref(), Some("s3cret"));
        assert!(ov.user.is_none());

        assert_eq!(config.tunnels.manager_config().remote_port, 6432);
        assert_eq!(config.tunnels.keepalive_secs, 30);
        let policy = config.tunnels.reconnect_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_bad_tunnel_timings_rejected() {
        for (tunnels, field) in [
            (r#"{"reconnect": {"max_attempts": 3, "multiplier": -1.5}}"#, "multiplier"),
            (r#"{"reconnect": {"multiplier": 0.5}}"#, "multiplier"),
            (r#"{"keepalive_secs": 0}"#, "keepalive_secs"),
            (r#"{"sweep_secs": 0}"#, "sweep_secs"),
            (r#"{"dial_timeout_secs": 0}"#, "dial_timeout_secs"),
            (r#"{"resolve_timeout_secs": 0}"#, "resolve_timeout_secs"),
        ] {
            let doc = format!(r#"{{"environments": {{"p": ["h"]}}, "tunnels": {}}}"#, tunnels);
            let err = Config::parse(&doc).unwrap_err();
            assert!(
                format!("{:#}", err).contains(field),
                "{} gave {:#}",
                tunnels,
                err
            );
        }

        let ok = Config::parse(
            r#"{"environments": {"p": ["h"]}, "tunnels": {"reconnect": {"multiplier": 1.0}}}"#,
        )
        .unwrap();
        assert_eq!(ok.tunnels.reconnect_policy().multiplier, 1.0);
    }

    #[test]
    fn test_scaffold_round_trips() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("config.json");
            scaffold(&path).await.unwrap();

            let config = Config::load(&path).await.unwrap();
            assert_eq!(config.environments.len(), 2);
            assert_eq!(config.autoconnect, vec![TunnelKey::new("test-server-1", "my-app")]);
        });
    }

    #[test]
    fn test_load_missing_file_names_path() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("absent.json");
            let err = Config::load(&path).await.unwrap_err();
            assert!(err.to_string().contains("absent.json"));
        });
    }
}
