//! Tunnel smoke test against a real host.
//!
//! Exercises the system ssh dialer, the connection pool, discovery and a full
//! tunnel lifecycle. The host needs at least one tenant under the root whose
//! compose project has a running `db` service.
//!
//! Run with:
//!   DRILLBIT_SMOKE_HOST=deploy@db1 cargo run --bin smoke_tunnel
//!
//! `DRILLBIT_SMOKE_ROOT` overrides the tenant root (default `/docker`).

use anyhow::{Context, Result};
use drillbit::config::HostConfig;
use drillbit::discovery::discover_host;
use drillbit::ssh::{Dialer, SystemSshDialer};
use drillbit::tunnel::{ConnectionPool, ManagerConfig, PoolConfig, TunnelManager};
use drillbit::{Entry, TunnelState};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smoke_tunnel=debug".parse()?)
                .add_directive("drillbit=debug".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let destination = std::env::var("DRILLBIT_SMOKE_HOST")
        .context("DRILLBIT_SMOKE_HOST must name an ssh destination")?;
    let mut host = match destination.split_once('@') {
        Some((user, host)) => HostConfig {
            user: Some(user.to_string()),
            ..HostConfig::new(host)
        },
        None => HostConfig::new(&destination),
    };
    if let Ok(root) = std::env::var("DRILLBIT_SMOKE_ROOT") {
        host.root = root;
    }

    println!("━━━ drillbit smoke test against {} ━━━\n", destination);

    smol::block_on(async {
        println!("━━━ Test 1: Dial and exec ━━━");
        test_dial_and_exec(&host).await?;

        let pool = Arc::new(ConnectionPool::new(
            Arc::new(SystemSshDialer::default()),
            PoolConfig::default(),
        ));

        println!("\n━━━ Test 2: Pool sharing ━━━");
        test_pool_sharing(&pool, &host).await?;

        println!("\n━━━ Test 3: Discovery ━━━");
        let entry = test_discovery(&pool, &host).await?;

        println!("\n━━━ Test 4: Tunnel lifecycle ━━━");
        test_tunnel_lifecycle(&pool, &entry).await?;

        println!("\n━━━ All smoke tests passed ━━━");
        Ok(())
    })
}

async fn test_dial_and_exec(host: &HostConfig) -> Result<()> {
    let session = SystemSshDialer::default().dial(&host.ssh_host()).await?;
    println!("  ✓ Control master up for {}", host.ssh_host());

    let output = session.exec("echo drillbit").await?;
    assert_eq!(output.trim(), "drillbit");
    println!("  ✓ Remote command ran over the control socket");

    session.keepalive().await?;
    println!("  ✓ Keepalive answered");

    session.close().await;
    println!("  ✓ Master closed");
    Ok(())
}

async fn test_pool_sharing(pool: &ConnectionPool, host: &HostConfig) -> Result<()> {
    let ssh_host = host.ssh_host();
    let a = pool.acquire(&ssh_host).await?;
    let b = pool.acquire(&ssh_host).await?;
    assert!(Arc::ptr_eq(a.session(), b.session()));
    assert_eq!(pool.ref_count(&ssh_host).await, Some(2));
    println!("  ✓ Two leases share one connection");

    pool.release(&a).await;
    pool.release(&b).await;
    assert_eq!(pool.ref_count(&ssh_host).await, None);
    b.dead().wait().await;
    println!("  ✓ Last release closed the connection");
    Ok(())
}

async fn test_discovery(pool: &ConnectionPool, host: &HostConfig) -> Result<Entry> {
    let tenants = discover_host(pool, host).await?;
    for tenant in &tenants {
        println!("  → {}", tenant.name);
    }
    let tenant = tenants
        .into_iter()
        .next()
        .context("no tenants found under the root")?;
    println!("  ✓ Discovery found tenant {}", tenant.name);

    let mut entry = Entry::new("smoke", &host.host, host.ssh_host(), &host.root, tenant.name);
    entry.password = tenant.password;
    Ok(entry)
}

async fn test_tunnel_lifecycle(pool: &Arc<ConnectionPool>, entry: &Entry) -> Result<()> {
    let manager = Arc::new(TunnelManager::new(pool.clone(), ManagerConfig::default()));
    let events = manager.subscribe();

    let connected = manager.connect(entry).await?;
    println!(
        "  ✓ Tunnel up: {} -> {}",
        connected.local_addr, connected.remote_addr
    );
    assert!(manager.is_registered(&entry.key()).await);

    let stream = smol::net::TcpStream::connect(connected.local_addr).await?;
    println!("  ✓ Local port accepts connections");
    drop(stream);

    manager.disconnect(&entry.key()).await;
    assert!(!manager.is_registered(&entry.key()).await);
    assert_eq!(pool.ref_count(&entry.ssh_host).await, None);
    println!("  ✓ Disconnect released the pooled connection");

    smol::Timer::after(Duration::from_millis(200)).await;
    assert!(
        smol::net::TcpStream::connect(connected.local_addr)
            .await
            .is_err()
    );
    println!("  ✓ Local port closed");

    let mut states = Vec::new();
    while let Ok((_, state)) = events.try_recv() {
        states.push(state);
    }
    assert!(matches!(states.first(), Some(TunnelState::Connecting)));
    assert!(matches!(states.last(), Some(TunnelState::Disconnected)));
    println!("  ✓ States: Connecting -> Connected -> Disconnected");

    manager.disconnect_all().await;
    assert_eq!(pool.live_connections().await, 0);
    Ok(())
}
