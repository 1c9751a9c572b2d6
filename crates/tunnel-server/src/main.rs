//! Serial Tunnel server entry point.
//!
//! Loads the configuration and the server key pair, binds the listener, and
//! serves until Ctrl-C or `quit` on the console.
//!
//! # Usage
//!
//! ```text
//! tunnel-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>         Config file [default: <config dir>/server.toml]
//!   --log-level <LEVEL>     Log level or filter directive
//!   --listen-ip <IP>        Address to listen on
//!   --listen-port <PORT>    TCP port to listen on
//!   --max-clients <N>       Connections admitted at once
//!   --serial-port <NAME>    Serial device to write to
//!   --baud-rate <N>         Serial baud rate
//!   --save-config           Write the effective configuration back to the file
//! ```
//!
//! # Console commands
//!
//! ```text
//! clients   list connected clients
//! quit      stop the server
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunnel_core::serial::NativeSerialOpener;
use tunnel_core::{KeyStore, Role};
use tunnel_server::application::manage_clients::render_client_table;
use tunnel_server::infrastructure::network::RelayServer;
use tunnel_server::infrastructure::storage::config::{self, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Serial Tunnel server: writes bytes from tunnel clients to a local serial port.
#[derive(Debug, Parser)]
#[command(name = "tunnel-server", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "TUNNEL_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (`error`, `warn`, `info`, `debug`, `trace`) or filter directive.
    #[arg(long)]
    log_level: Option<String>,

    /// Address to listen on.
    #[arg(long, env = "TUNNEL_LISTEN_IP")]
    listen_ip: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "TUNNEL_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Maximum number of clients served at once.
    #[arg(long)]
    max_clients: Option<usize>,

    /// Serial device to write to, e.g. `COM3` or `/dev/ttyUSB0`.
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
    fn apply_to(&self, cfg: &mut ServerConfig) {
        if let Some(level) = &self.log_level {
            cfg.server.log_level = level.clone();
        }
        if let Some(ip) = &self.listen_ip {
            cfg.network.listen_ip = ip.clone();
        }
        if let Some(port) = self.listen_port {
            cfg.network.listen_port = port;
        }
        if let Some(max) = self.max_clients {
            cfg.network.max_clients = max;
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

/// Reads operator commands from stdin until `quit` or end of input.
async fn run_console(server: &RelayServer) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "" => {}
                "clients" => println!("{}", render_client_table(&server.clients().await)),
                "quit" | "exit" => return,
                other => println!("unknown command `{other}` (try `clients` or `quit`)"),
            },
            // Without a console (service, redirected stdin) wait for Ctrl-C only.
            Ok(None) => std::future::pending::<()>().await,
            Err(e) => {
                warn!("console unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_file_path().context("locating the server config file")?,
    };
    let mut cfg = config::load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    cli.apply_to(&mut cfg);

    init_logging(&cfg.server.log_level);
    info!("Serial Tunnel server starting (config {})", config_path.display());

    if cli.save_config {
        config::save_config(&config_path, &cfg)
            .with_context(|| format!("saving {}", config_path.display()))?;
        info!("configuration saved to {}", config_path.display());
    }

    // ── Keys ──────────────────────────────────────────────────────────────────
    let key_dir = cfg.keys.resolve_dir().context("locating the key directory")?;
    let key_size = cfg.keys.rsa_key_size;
    let keys = tokio::task::spawn_blocking(move || {
        KeyStore::new(key_dir).load_or_generate(Role::Server, key_size)
    })
    .await
    .context("key loading task panicked")?
    .context("loading server keys")?;

    // ── Listener ──────────────────────────────────────────────────────────────
    let server = RelayServer::start(
        &cfg.network.listen_ip,
        cfg.network.listen_port,
        cfg.server_settings(),
        Arc::new(keys),
        Arc::new(NativeSerialOpener::new(cfg.serial.clone())),
    )
    .await
    .context("starting the listener")?;
    info!(
        "serving on {} (max {} clients, serial {})",
        server.local_addr(),
        cfg.network.max_clients,
        cfg.serial.port
    );

    // ── Console and Ctrl-C ────────────────────────────────────────────────────
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("could not listen for Ctrl-C: {e}");
            }
            info!("shutdown signal received");
        }
        _ = run_console(&server) => info!("quit requested"),
    }

    server.stop().await;
    Ok(())
}
