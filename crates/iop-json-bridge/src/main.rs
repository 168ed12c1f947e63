//! IOP JSON bridge: entry point.
//!
//! This binary lets WebSocket clients exchange JAUS/IOP messages as JSON.
//! It keeps one TCP connection to a JAUS Node Manager, translates binary
//! frames to JSON for every subscribed client, and turns client JSON into
//! binary frames using the message schemas loaded at startup.
//!
//! # Usage
//!
//! ```text
//! iop-json-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    TOML config file
//!       --ws-bind <IP>     WebSocket bind address [default: 0.0.0.0]
//!       --ws-port <PORT>   WebSocket port [default: 8080]
//!       --nm-host <HOST>   Node Manager host [default: 127.0.0.1]
//!       --nm-port <PORT>   Node Manager port [default: 3794]
//!       --schemas <PATH>   Schema artifact file or directory [default: schemas]
//!       --jaus-id <S.N.C>  The bridge's own JAUS address [default: 127.100.1]
//! ```
//!
//! # Configuration precedence
//!
//! Command-line flags and `IOP_*` environment variables win over the config
//! file, which wins over the built-in defaults.
//!
//! | Variable                  | Flag                    |
//! |---------------------------|-------------------------|
//! | `IOP_CONFIG`              | `--config`              |
//! | `IOP_WS_BIND`             | `--ws-bind`             |
//! | `IOP_WS_PORT`             | `--ws-port`             |
//! | `IOP_NM_HOST`             | `--nm-host`             |
//! | `IOP_NM_PORT`             | `--nm-port`             |
//! | `IOP_SCHEMAS`             | `--schemas`             |
//! | `IOP_JAUS_ID`             | `--jaus-id`             |
//! | `IOP_CONNECT_TIMEOUT_MS`  | `--connect-timeout-ms`  |
//! | `IOP_BACKOFF_INITIAL_MS`  | `--backoff-initial-ms`  |
//! | `IOP_BACKOFF_MAX_MS`      | `--backoff-max-ms`      |
//! | `IOP_QUEUE_CAPACITY`      | `--queue-capacity`      |
//! | `IOP_WRITE_TIMEOUT_MS`    | `--write-timeout-ms`    |
//! | `IOP_LOG_LEVEL`           | `--log-level`           |
//!
//! `RUST_LOG`, when set, overrides the log level entirely.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use iop_core::{JausAddress, SchemaRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

use iop_json_bridge::domain::config::DEFAULT_NODE_MANAGER_PORT;
use iop_json_bridge::domain::{BridgeConfig, FileConfig};
use iop_json_bridge::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// JSON-over-WebSocket gateway to a JAUS/IOP Node Manager.
///
/// Every option is optional: anything not given here falls back to the
/// config file, then to the built-in default.
#[derive(Debug, Default, Parser)]
#[command(
    name = "iop-json-bridge",
    about = "JSON-over-WebSocket gateway to a JAUS/IOP Node Manager",
    version
)]
struct Cli {
    /// TOML config file.
    #[arg(short, long, env = "IOP_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to bind the WebSocket server to.
    #[arg(long, env = "IOP_WS_BIND")]
    ws_bind: Option<IpAddr>,

    /// WebSocket port.
    #[arg(long, env = "IOP_WS_PORT")]
    ws_port: Option<u16>,

    /// Hostname or IP of the Node Manager.
    #[arg(long, env = "IOP_NM_HOST")]
    nm_host: Option<String>,

    /// TCP port of the Node Manager.
    #[arg(long, env = "IOP_NM_PORT")]
    nm_port: Option<u16>,

    /// Schema artifact file, or a directory of `*.json` artifacts.
    #[arg(long, env = "IOP_SCHEMAS")]
    schemas: Option<PathBuf>,

    /// JAUS address the bridge registers as (`subsystem.node.component`).
    #[arg(long, env = "IOP_JAUS_ID")]
    jaus_id: Option<JausAddress>,

    #[arg(long, env = "IOP_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    #[arg(long, env = "IOP_BACKOFF_INITIAL_MS")]
    backoff_initial_ms: Option<u64>,

    #[arg(long, env = "IOP_BACKOFF_MAX_MS")]
    backoff_max_ms: Option<u64>,

    /// Outbound frames a client may have queued before it is disconnected.
    #[arg(long, env = "IOP_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    #[arg(long, env = "IOP_WRITE_TIMEOUT_MS")]
    write_timeout_ms: Option<u64>,

    /// Log filter used when `RUST_LOG` is not set (e.g. `info`, `debug`).
    #[arg(long, env = "IOP_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Builds the final [`BridgeConfig`]: defaults, then the config file,
    /// then these arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = BridgeConfig::default();

        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let file = FileConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            config = file.apply(config);
        }

        config = self.apply(config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply(self, mut config: BridgeConfig) -> BridgeConfig {
        let ms = Duration::from_millis;

        if let Some(ip) = self.ws_bind {
            config.ws_bind_addr.set_ip(ip);
        }
        if let Some(port) = self.ws_port {
            config.ws_bind_addr.set_port(port);
        }

        if self.nm_host.is_some() || self.nm_port.is_some() {
            let (host, port) = match config.node_manager_addr.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.to_string()),
                None => (
                    config.node_manager_addr.clone(),
                    DEFAULT_NODE_MANAGER_PORT.to_string(),
                ),
            };
            let host = self.nm_host.unwrap_or(host);
            let port = self.nm_port.map(|p| p.to_string()).unwrap_or(port);
            config.node_manager_addr = format!("{host}:{port}");
        }

        if let Some(v) = self.schemas {
            config.schema_path = v;
        }
        if let Some(v) = self.jaus_id {
            config.local_address = v;
        }
        if let Some(v) = self.connect_timeout_ms {
            config.connect_timeout = ms(v);
        }
        if let Some(v) = self.backoff_initial_ms {
            config.backoff_initial = ms(v);
        }
        if let Some(v) = self.backoff_max_ms {
            config.backoff_max = ms(v);
        }
        if let Some(v) = self.queue_capacity {
            config.session_queue_capacity = v;
        }
        if let Some(v) = self.write_timeout_ms {
            config.write_timeout = ms(v);
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        config
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// # What happens at startup
///
/// 1. CLI arguments (and the optional config file) become a [`BridgeConfig`].
/// 2. `tracing_subscriber` is initialised; `RUST_LOG` wins over `log_level`.
/// 3. The schema registry is loaded.  Any schema error is fatal.
/// 4. A Ctrl+C handler clears the shared `running` flag.
/// 5. [`run_server`] serves clients until the flag is cleared.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_bridge_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let registry = SchemaRegistry::load(&config.schema_path).with_context(|| {
        format!("failed to load message schemas from {}", config.schema_path.display())
    })?;
    info!(
        "loaded {} message schemas from {}",
        registry.len(),
        config.schema_path.display()
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::SeqCst);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    run_server(config, Arc::new(registry), running).await?;

    info!("iop-json-bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
