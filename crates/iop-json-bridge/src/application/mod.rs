//! Application layer for iop-json-bridge.
//!
//! Knows *what* to do with each frame; delegates *how* bytes move to the
//! infrastructure layer.
//!
//! # Responsibilities
//!
//! - Translating client JSON into JAUS data frames and back (`translator`)
//! - Tracking sessions, their filters and their bounded queues (`sessions`)
//! - Routing, fan-out and error reporting (`gateway`)
//! - The [`NodeManagerPort`] seam the gateway talks through (`ports`)
//!
//! # What does NOT belong here?
//!
//! - Opening sockets or listening for connections
//! - Tokio task spawning
//! - WebSocket framing (handled by tokio-tungstenite)

pub mod gateway;
pub mod ports;
pub mod sessions;
pub mod translator;

pub use gateway::Gateway;
pub use ports::{LinkError, NodeManagerPort};
pub use sessions::{Delivery, SessionHandle, SessionId, SessionRegistry};
pub use translator::{translate_client_message, translate_node_manager_frame, GatewayError};
