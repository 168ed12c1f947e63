//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is assembled once at startup from three layers, later layers winning:
//!
//! 1. built-in defaults ([`BridgeConfig::default`]);
//! 2. an optional TOML file ([`FileConfig`]);
//! 3. command-line arguments and `IOP_*` environment variables (see `main.rs`).
//!
//! # Config file
//!
//! Every key is optional.  Unknown keys are rejected so a typo does not
//! silently fall back to a default.
//!
//! ```toml
//! [websocket]
//! bind = "0.0.0.0:8080"
//! queue_capacity = 256
//! write_timeout_ms = 5000
//!
//! [node_manager]
//! address = "127.0.0.1:3794"
//! jaus_id = "127.100.1"
//! connect_timeout_ms = 3000
//! backoff_initial_ms = 500
//! backoff_max_ms = 10000
//!
//! [schemas]
//! path = "schemas"
//!
//! [logging]
//! level = "info"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use iop_core::JausAddress;
use serde::Deserialize;
use thiserror::Error;

/// Default TCP port of a JAUS Node Manager.
pub const DEFAULT_NODE_MANAGER_PORT: u16 = 3794;

/// Default WebSocket port.
pub const DEFAULT_WS_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// All runtime configuration for the bridge.
///
/// Build this struct once at startup and share it behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use iop_json_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 8080);
/// assert_eq!(cfg.local_address.to_string(), "127.100.1");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Address the WebSocket server binds to.
    pub ws_bind_addr: SocketAddr,

    /// `host:port` of the Node Manager's JAUS TCP transport.
    pub node_manager_addr: String,

    /// Schema artifact file, or a directory of `*.json` artifacts.
    pub schema_path: PathBuf,

    /// JAUS address the bridge registers as, and the default source of
    /// messages whose client did not name one.
    pub local_address: JausAddress,

    /// Upper bound on one TCP connect attempt to the Node Manager.
    pub connect_timeout: Duration,

    /// First reconnect delay; doubles on each failure up to `backoff_max`.
    pub backoff_initial: Duration,
    pub backoff_max: Duration,

    /// Outbound frames a session may have queued before it is evicted.
    pub session_queue_capacity: usize,

    /// Longest a single WebSocket write may take before the session is evicted.
    pub write_timeout: Duration,

    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for BridgeConfig {
    /// | Field                  | Default           |
    /// |------------------------|-------------------|
    /// | ws_bind_addr           | `0.0.0.0:8080`    |
    /// | node_manager_addr      | `127.0.0.1:3794`  |
    /// | schema_path            | `schemas`         |
    /// | local_address          | `127.100.1`       |
    /// | connect_timeout        | 3 s               |
    /// | backoff_initial / max  | 500 ms / 10 s     |
    /// | session_queue_capacity | 256               |
    /// | write_timeout          | 5 s               |
    /// | log_level              | `info`            |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)),
            node_manager_addr: format!("127.0.0.1:{DEFAULT_NODE_MANAGER_PORT}"),
            schema_path: PathBuf::from("schemas"),
            local_address: JausAddress::new(127, 100, 1),
            connect_timeout: Duration::from_secs(3),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            session_queue_capacity: 256,
            write_timeout: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Rejects combinations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff_initial.is_zero() || self.backoff_max < self.backoff_initial {
            return Err(ConfigError::Invalid {
                key: "backoff_initial_ms",
                reason: "must be non-zero and not above backoff_max_ms".to_string(),
            });
        }
        if self.connect_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "timeouts",
                reason: "connect and write timeouts must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

// ── Config file schema ────────────────────────────────────────────────────────

/// Contents of the optional TOML config file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub websocket: WebSocketSection,
    pub node_manager: NodeManagerSection,
    pub schemas: SchemasSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketSection {
    pub bind: Option<SocketAddr>,
    pub queue_capacity: Option<usize>,
    pub write_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeManagerSection {
    pub address: Option<String>,
    pub jaus_id: Option<JausAddress>,
    pub connect_timeout_ms: Option<u64>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SchemasSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl FileConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlays every value present in the file onto `config`.
    pub fn apply(self, mut config: BridgeConfig) -> BridgeConfig {
        let ms = Duration::from_millis;
        let ws = self.websocket;
        let nm = self.node_manager;

        if let Some(v) = ws.bind {
            config.ws_bind_addr = v;
        }
        if let Some(v) = ws.queue_capacity {
            config.session_queue_capacity = v;
        }
        if let Some(v) = ws.write_timeout_ms {
            config.write_timeout = ms(v);
        }
        if let Some(v) = nm.address {
            config.node_manager_addr = v;
        }
        if let Some(v) = nm.jaus_id {
            config.local_address = v;
        }
        if let Some(v) = nm.connect_timeout_ms {
            config.connect_timeout = ms(v);
        }
        if let Some(v) = nm.backoff_initial_ms {
            config.backoff_initial = ms(v);
        }
        if let Some(v) = nm.backoff_max_ms {
            config.backoff_max = ms(v);
        }
        if let Some(v) = self.schemas.path {
            config.schema_path = v;
        }
        if let Some(v) = self.logging.level {
            config.log_level = v;
        }
        config
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
