//! kidslockd - The kidslock background service
//!
//! Loads the configuration, opens the store, picks the reachability probe
//! and runs the service until a termination signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use kidslock_config::{load_config, Policy, ProbeKind, ServiceConfig};
use kidslock_device_api::{ReachabilityProber, RemoteControl};
use kidslock_device_net::{HttpRemoteControl, IcmpProber, TcpProber};
use kidslock_store::{SqliteStore, Store};
use kidslock_util::default_config_path;
use kidslockd::Service;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// kidslockd - Screen-time budgets and bedtimes for networked devices
#[derive(Parser, Debug)]
#[command(name = "kidslockd")]
#[command(about = "Screen-time budgets and bedtimes for networked devices", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/kidslock/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set KIDSLOCK_SOCKET env var)
    #[arg(short, long, env = "KIDSLOCK_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set KIDSLOCK_DATA_DIR env var)
    #[arg(short, long, env = "KIDSLOCK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn load_policy(args: &Args) -> Result<Policy> {
    if !args.config.exists() {
        warn!(
            config_path = %args.config.display(),
            "Config file not found, starting with defaults and no configured devices"
        );
        return Ok(Policy::default());
    }

    let policy = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!(
        config_path = %args.config.display(),
        device_count = policy.devices.len(),
        "Configuration loaded"
    );
    Ok(policy)
}

fn build_prober(config: &ServiceConfig) -> Arc<dyn ReachabilityProber> {
    let tcp = || -> Arc<dyn ReachabilityProber> {
        Arc::new(TcpProber::new(config.control_port, config.probe_timeout))
    };
    match config.probe {
        ProbeKind::Tcp => tcp(),
        ProbeKind::Icmp => match IcmpProber::new(config.probe_timeout) {
            Ok(prober) => Arc::new(prober),
            Err(e) => {
                warn!(error = %e, "ICMP sockets unavailable, falling back to TCP probe");
                tcp()
            }
        },
    }
}

async fn run(args: Args) -> Result<()> {
    let policy = load_policy(&args)?;

    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| policy.service.socket_path.clone());

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| policy.service.data_dir.clone());

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

    let db_path = data_dir.join("kidslock.db");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {:?}", db_path))?,
    );

    info!(db_path = %db_path.display(), "Store initialized");

    let prober = build_prober(&policy.service);
    let remote: Arc<dyn RemoteControl> = Arc::new(
        HttpRemoteControl::new(policy.service.control_port, policy.service.command_timeout)
            .context("Failed to create HTTP client")?,
    );

    let service = Service::new(policy, &socket_path, store, prober, remote).await?;

    info!(socket_path = %socket_path.display(), "IPC server started");

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
        }
        let _ = shutdown_tx.send(true);
    });

    service.run(shutdown_rx).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "kidslockd starting");
    if kidslock_util::is_mock_time_active() {
        warn!(now = %kidslock_util::format_datetime_full(&kidslock_util::now()), "Mock time is active");
    }

    run(args).await
}
