//! Serial Tunnel client entry point.
//!
//! Loads the configuration, loads or generates the client key pair, then runs
//! the session loop until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! tunnel-client [OPTIONS]
//!
//! Options:
//!   --config <PATH>         Config file [default: <config dir>/client.toml]
//!   --log-level <LEVEL>     Log level or filter directive
//!   --server-ip <IP>        Server address
//!   --server-port <PORT>    Server port
//!   --serial-port <NAME>    Local serial device
//!   --baud-rate <N>         Serial baud rate
//!   --save-config           Write the effective configuration back to the file
//! ```
//!
//! Command-line values override the config file.  `RUST_LOG`, when set, wins
//! over both for logging.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunnel_client::application::session::ClientSession;
use tunnel_client::infrastructure::network::{TcpConnector, TcpConnectorConfig};
use tunnel_client::infrastructure::storage::config::{self, ClientConfig};
use tunnel_core::serial::NativeSerialOpener;
use tunnel_core::{KeyStore, Role};

/// How long the session loop gets to close its link and port on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Serial Tunnel client: forwards a local serial port to a tunnel server.
#[derive(Debug, Parser)]
#[command(name = "tunnel-client", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "TUNNEL_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (`error`, `warn`, `info`, `debug`, `trace`) or filter directive.
    #[arg(long)]
    log_level: Option<String>,

    /// IP address or hostname of the tunnel server.
    #[arg(long, env = "TUNNEL_SERVER_IP")]
    server_ip: Option<String>,

    /// TCP port of the tunnel server.
    #[arg(long, env = "TUNNEL_SERVER_PORT")]
    server_port: Option<u16>,

    /// Serial device to read from, e.g. `COM1` or `/dev/ttyUSB0`.
    #[arg(long, env = "TUNNEL_SERIAL_PORT")]
    serial_port: Option<String>,

    /// Serial baud rate.
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Persist the effective configuration (file values plus overrides).
    #[arg(long)]
    save_config: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded file.
    fn apply_to(&self, cfg: &mut ClientConfig) {
        if let Some(level) = &self.log_level {
            cfg.client.log_level = level.clone();
        }
        if let Some(ip) = &self.server_ip {
            cfg.network.server_ip = ip.clone();
        }
        if let Some(port) = self.server_port {
            cfg.network.server_port = port;
        }
        if let Some(port) = &self.serial_port {
            cfg.serial.port = port.clone();
        }
        if let Some(baud) = self.baud_rate {
            cfg.serial.baud_rate = baud;
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_file_path().context("locating the client config file")?,
    };
    let mut cfg = config::load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    cli.apply_to(&mut cfg);

    init_logging(&cfg.client.log_level);
    info!("Serial Tunnel client starting (config {})", config_path.display());

    if cli.save_config {
        config::save_config(&config_path, &cfg)
            .with_context(|| format!("saving {}", config_path.display()))?;
        info!("configuration saved to {}", config_path.display());
    }

    // ── Keys ──────────────────────────────────────────────────────────────────
    let key_dir = cfg.keys.resolve_dir().context("locating the key directory")?;
    let key_size = cfg.keys.rsa_key_size;
    let keys = tokio::task::spawn_blocking(move || {
        KeyStore::new(key_dir).load_or_generate(Role::Client, key_size)
    })
    .await
    .context("key loading task panicked")?
    .context("loading client keys")?;
    let keys = Arc::new(keys);

    // ── Session ───────────────────────────────────────────────────────────────
    let connector = TcpConnector::new(
        TcpConnectorConfig::new(
            cfg.network.server_ip.clone(),
            cfg.network.server_port,
            cfg.retry_interval(),
        ),
        keys,
    );
    let serial = NativeSerialOpener::new(cfg.serial.clone());
    let session = ClientSession::new(
        Arc::new(connector),
        Arc::new(serial),
        cfg.session_timings(),
        cfg.session_limits(),
    );

    let running = Arc::new(AtomicBool::new(true));
    let mut session_task = tokio::spawn(session.run(Arc::clone(&running)));

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("could not listen for Ctrl-C: {e}");
            }
            info!("shutdown signal received");
        }
        joined = &mut session_task => {
            warn!("session loop ended unexpectedly: {joined:?}");
            return Ok(());
        }
    }

    running.store(false, Ordering::Relaxed);
    match tokio::time::timeout(SHUTDOWN_GRACE, session_task).await {
        Ok(_) => info!("Serial Tunnel client stopped"),
        Err(_) => warn!("session loop did not stop within {SHUTDOWN_GRACE:?}"),
    }
    Ok(())
}
