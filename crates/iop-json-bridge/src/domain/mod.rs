//! Domain layer for iop-json-bridge.
//!
//! Pure types with no I/O: the JSON envelope clients speak, the link state
//! they are told about, and the bridge configuration.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - File I/O or environment variable reading
//! - Schema-dependent translation (that is the application layer)

pub mod config;
pub mod link;
pub mod messages;

pub use config::{BridgeConfig, ConfigError, FileConfig};
pub use link::LinkState;
pub use messages::{ClientFrame, ClientMessage, ErrorKind, FrameParseError, ServerFrame};
