//! beacond: the Beacon daemon.
//!
//! Loads a `beacon.toml`, opens the coordination store, registers this
//! node while it is healthy and in rotation, and serves the admin API.
//!
//! # Usage
//!
//! ```text
//! beacond run --config /etc/beacon/beacon.toml --data-dir /var/lib/beacon
//! beacond check-config --config /etc/beacon/beacon.toml
//! beacond init --service orders --host 10.0.0.1 --port 8080 > beacon.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beacon_core::BeaconConfig;
use beacon_membership::DiscoveryBundle;
use beacon_store::{CoordinationStore, Ensemble};

const DEFAULT_LOG_FILTER: &str = "info,beacond=debug,beacon=debug";

#[derive(Parser)]
#[command(name = "beacond", about = "Beacon service registration daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register this node and serve the admin API until interrupted.
    Run {
        /// Path to beacon.toml.
        #[arg(long)]
        config: PathBuf,

        /// Directory for the on-disk store. In-memory when omitted.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Advertised host, overriding `node.host`.
        #[arg(long)]
        host: Option<String>,

        /// Advertised port, overriding `node.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Admin API listen address, overriding `admin.listen`.
        #[arg(long)]
        admin_listen: Option<String>,
    },
    /// Parse and validate a config file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print a minimal config for a service.
    Init {
        #[arg(long)]
        service: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            host,
            port,
            admin_listen,
        } => run(&config, data_dir, host, port, admin_listen).await,
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            println!(
                "config ok: service {} at {}:{} (namespace {})",
                config.service.name, config.node.host, config.node.port, config.service.namespace
            );
            Ok(())
        }
        Command::Init {
            service,
            host,
            port,
        } => {
            let config = BeaconConfig::scaffold(&service, &host, port);
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<BeaconConfig> {
    BeaconConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn open_ensemble(data_dir: Option<&Path>) -> anyhow::Result<Ensemble> {
    match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data dir {}", dir.display()))?;
            let db_path = dir.join("beacon.redb");
            let ensemble = Ensemble::open(&db_path)?;
            info!(path = ?db_path, "coordination store opened");
            Ok(ensemble)
        }
        None => {
            let ensemble = Ensemble::open_in_memory()?;
            info!("in-memory coordination store opened");
            Ok(ensemble)
        }
    }
}

async fn run(
    config_path: &Path,
    data_dir: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    admin_listen: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(listen) = admin_listen {
        config.admin.listen = listen;
    }
    info!(service = %config.service.name, namespace = %config.service.namespace, "beacon daemon starting");

    // Bind first: nothing is registered if the admin API cannot serve.
    let listener = bind_admin(&config.admin.listen).await?;

    // ── Store + bundle ─────────────────────────────────────────

    let ensemble = open_ensemble(data_dir.as_deref())?;
    ensemble.set_session_timeout(config.store.session_timeout());
    let reaper = ensemble.spawn_reaper();
    let store: Arc<dyn CoordinationStore> = Arc::new(ensemble.connect()?);

    let mut builder = DiscoveryBundle::builder(config).store(store);
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    let bundle = Arc::new(builder.build()?);
    if let Err(e) = bundle.start().await {
        if let Err(e) = bundle.shutdown().await {
            warn!(error = %e, "shutdown incomplete");
        }
        reaper.abort();
        return Err(e.into());
    }
    bundle.server_status().mark_started();

    // ── Admin API ──────────────────────────────────────────────

    let router = beacon_api::build_router(bundle.clone());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await;

    // ── Shutdown ───────────────────────────────────────────────

    if let Err(e) = bundle.shutdown().await {
        warn!(error = %e, "shutdown incomplete");
    }
    reaper.abort();
    served.context("admin API server failed")?;
    info!("beacon daemon stopped");
    Ok(())
}

async fn bind_admin(listen: &str) -> anyhow::Result<tokio::net::TcpListener> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid admin.listen {listen:?}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin API on {addr}"))?;
    info!(%addr, "admin API listening");
    Ok(listener)
}
