use anyhow::{Context, Result};
use clap::Parser;
use drillbit::config::{self, Config};
use drillbit::discovery::{Discovery, discover_all};
use drillbit::ssh::SystemSshDialer;
use drillbit::state::TunnelBoard;
use drillbit::tunnel::{ConnectionPool, HealthSweep, TunnelManager, reconnect};
use drillbit::{Entry, TunnelKey, TunnelState};
use smol::future::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;

/// SSH tunnels to the Postgres databases of your docker compose tenants.
#[derive(Parser, Debug)]
#[command(name = "drillbit", version)]
struct Cli {
    /// Config file (default: ~/.config/drillbit/config.json)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write an example config and exit
    #[arg(long)]
    init: bool,

    /// Connect this entry on startup, in addition to the autoconnect list
    #[arg(long = "connect", value_name = "HOST:TENANT")]
    connect: Vec<TunnelKey>,

    /// Connect every discovered entry
    #[arg(long)]
    all: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

enum Event {
    State(TunnelKey, TunnelState),
    Sweep,
    Shutdown,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "drillbit=debug"
    } else {
        "drillbit=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    smol::block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };

    if cli.init || !path.exists() {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        config::scaffold(&path).await?;
        println!();
        println!("  Created config file: {}", path.display());
        println!("  Edit it to add your SSH hosts, then run drillbit again.");
        println!();
        return Ok(());
    }

    let config = Config::load(&path).await?;
    let settings = &config.tunnels;

    let pool = Arc::new(ConnectionPool::new(
        Arc::new(SystemSshDialer::default()),
        settings.pool_config(),
    ));
    let manager = Arc::new(TunnelManager::new(pool.clone(), settings.manager_config()));
    let policy = settings.reconnect_policy();

    println!("Discovering databases...");
    let discovery = discover_all(&pool, &config).await;
    print_discovery(&discovery);
    let mut board = TunnelBoard::new(discovery.entries);

    let wanted: Vec<TunnelKey> = if cli.all {
        board.entries().iter().map(Entry::key).collect()
    } else {
        config
            .autoconnect
            .iter()
            .chain(&cli.connect)
            .cloned()
            .collect()
    };
    for key in wanted.iter().filter(|key| board.get(key).is_none()) {
        tracing::warn!("{} was not discovered, skipping", key);
    }
    for entry in board.select(&wanted) {
        let manager = manager.clone();
        smol::spawn(async move {
            let _ = manager.connect(&entry).await;
        })
        .detach();
    }

    let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let (sweep_tx, sweep_rx) = async_channel::unbounded();
    let _sweep = HealthSweep::spawn(settings.sweep_interval(), sweep_tx);
    let events = manager.subscribe();

    loop {
        let event = async {
            match events.recv().await {
                Ok((key, state)) => Event::State(key, state),
                Err(_) => Event::Shutdown,
            }
        }
        .or(async {
            match sweep_rx.recv().await {
                Ok(()) => Event::Sweep,
                Err(_) => Event::Shutdown,
            }
        })
        .or(async {
            let _ = shutdown_rx.recv().await;
            Event::Shutdown
        })
        .await;

        match event {
            Event::State(key, state) => {
                if let Some(entry) = board.apply(&key, state) {
                    print_state(entry);
                }
            }
            Event::Sweep => {
                for entry in board.due_for_reconnect(&manager).await {
                    tracing::info!("Tunnel {} dropped, reconnecting", entry.key());
                    let manager = manager.clone();
                    let policy = policy.clone();
                    smol::spawn(async move {
                        if let Err(e) = reconnect(&manager, &entry, &policy).await {
                            tracing::debug!("Reconnect of {} gave up: {}", entry.key(), e);
                        }
                    })
                    .detach();
                }
            }
            Event::Shutdown => break,
        }
    }

    println!("Shutting down tunnels...");
    manager.disconnect_all().await;
    Ok(())
}

fn print_discovery(discovery: &Discovery) {
    for error in &discovery.errors {
        println!("  ! {}: {}", error.host, error.error);
    }
    if discovery.entries.is_empty() {
        println!("No databases found.");
        return;
    }

    println!();
    println!(
        "  {:<10} {:<24} {:<24} {:>6}",
        "ENV", "HOST", "TENANT", "PORT"
    );
    for entry in &discovery.entries {
        println!(
            "  {:<10} {:<24} {:<24} {:>6}",
            entry.env, entry.host, entry.tenant, entry.local_port
        );
    }
    println!();
}

fn print_state(entry: &Entry) {
    match &entry.state {
        TunnelState::Connected { .. } => {
            println!("  + {} {}", entry.key(), entry.connection_url());
        }
        TunnelState::Failed { error } => println!("  x {} {}", entry.key(), error),
        TunnelState::Reconnecting {
            attempt,
            max_attempts,
        } => println!(
            "  ~ {} reconnecting ({}/{})",
            entry.key(),
            attempt,
            max_attempts
        ),
        TunnelState::Disconnected => println!("  - {} disconnected", entry.key()),
        TunnelState::Idle | TunnelState::Connecting => {}
    }
}
