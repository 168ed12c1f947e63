//! Infrastructure layer for iop-json-bridge.
//!
//! All I/O lives here: the WebSocket listener and the TCP link to the
//! Node Manager.
//!
//! # What does NOT belong here?
//!
//! - Translation or routing decisions (that is the application layer)
//! - Message type definitions (that is the domain layer)
//! - Configuration parsing (that is done in `main.rs`)

pub mod node_manager;
pub mod ws_server;

pub use node_manager::{spawn_link, Backoff, LinkEvent, LinkHandle};
pub use ws_server::{run_server, serve_listener};
