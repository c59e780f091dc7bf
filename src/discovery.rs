//! Enumerates tenant databases on the configured hosts.

use crate::config::{Config, HostConfig};
use crate::entry::{Entry, shell_quote};
use crate::ports::assign_ports;
use crate::tunnel::{ConnectionPool, with_timeout};
use anyhow::{Context, Result};
use std::time::Duration;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A tenant directory with a compose project declaring a `db` service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub name: String,
    /// `POSTGRES_PASSWORD` from the tenant's `.env`, empty when absent
    pub password: String,
}

/// A host discovery could not enumerate.
#[derive(Debug, Clone)]
pub struct HostError {
    pub host: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Sorted by key, with local ports assigned
    pub entries: Vec<Entry>,
    pub errors: Vec<HostError>,
}

/// Shell script listing `<name>|<password>` for every tenant under `root`.
fn discovery_script(root: &str) -> String {
    format!(
        r#"for dir in {root}/*/; do
    name=$(basename "$dir")
    compose=""
    for f in "$dir/docker-compose.yml" "$dir/docker-compose.yaml" "$dir/compose.yml" "$dir/compose.yaml"; do
        [ -f "$f" ] && compose="$f" && break
    done
    [ -z "$compose" ] && continue
    if grep -qE '^\s+db:' "$compose" 2>/dev/null; then
        pw=""
        if [ -f "$dir/.env" ]; then
            pw=$(grep -oP 'POSTGRES_PASSWORD=\K.*' "$dir/.env" 2>/dev/null || true)
        fi
        echo "$name|$pw"
    fi
done"#,
        root = shell_quote(root.trim_end_matches('/'))
    )
}

/// Parse the script's output, skipping blank lines.
pub fn parse_tenants(output: &str) -> Vec<Tenant> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, password) = line.split_once('|').unwrap_or((line, ""));
            Tenant {
                name: name.to_string(),
                password: password.to_string(),
            }
        })
        .collect()
}

/// List the tenants on one host over its pooled connection.
pub async fn discover_host(pool: &ConnectionPool, host: &HostConfig) -> Result<Vec<Tenant>> {
    let ssh_host = host.ssh_host();
    let lease = pool.acquire(&ssh_host).await?;

    let command = format!("bash -c {}", shell_quote(&discovery_script(&host.root)));
    let output = with_timeout(DISCOVERY_TIMEOUT, lease.session().exec(&command)).await;
    pool.release(&lease).await;

    let output = output
        .ok_or_else(|| anyhow::anyhow!("timed out after {}s", DISCOVERY_TIMEOUT.as_secs()))?
        .with_context(|| format!("Discovery on {} failed", ssh_host))?;

    let tenants = parse_tenants(&output);
    tracing::info!("Discovered {} databases on {}", tenants.len(), host.host);
    Ok(tenants)
}

/// Discover every configured host concurrently.
///
/// A failing host is reported in [`Discovery::errors`] and does not affect
/// the others. Overrides from the config are applied and local ports
/// assigned over the complete result.
pub async fn discover_all(pool: &ConnectionPool, config: &Config) -> Discovery {
    let hosts: Vec<(&str, &HostConfig)> = config.hosts().collect();
    let results =
        futures::future::join_all(hosts.iter().map(|(_, host)| discover_host(pool, host))).await;

    let mut discovery = Discovery::default();
    for ((env, host), result) in hosts.into_iter().zip(results) {
        match result {
            Ok(tenants) => {
                discovery
                    .entries
                    .extend(tenants.into_iter().map(|t| entry_for(config, env, host, t)));
            }
            Err(e) => {
                tracing::warn!("Discovery on {} failed: {:#}", host.host, e);
                discovery.errors.push(HostError {
                    host: host.host.clone(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    assign_ports(&mut discovery.entries);
    discovery
}

fn entry_for(config: &Config, env: &str, host: &HostConfig, tenant: Tenant) -> Entry {
    let mut entry = Entry::new(env, &host.host, host.ssh_host(), &host.root, tenant.name);
    entry.password = tenant.password;

    if let Some(ov) = config.override_for(&entry.key()) {
        if let Some(user) = &ov.user {
            entry.db_user = user.clone();
        }
        if let Some(password) = &ov.password {
            entry.password = password.clone();
        }
        if let Some(database) = &ov.database {
            entry.database = database.clone();
        }
    }
    entry
}
