//! iop-json-bridge library crate.
//!
//! A gateway that lets WebSocket clients speak JSON to a JAUS/IOP system.
//! The schema registry and binary codec live in `iop-core`; this crate adds
//! the sessions, the routing and the two network edges.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! WebSocket clients (JSON text frames)
//!         ↕
//! [iop-json-bridge]
//!   ├── domain/           Pure types: client/server frames, LinkState, BridgeConfig
//!   ├── application/      Translation, session registry, Gateway, NodeManagerPort
//!   └── infrastructure/
//!         ├── ws_server/     WebSocket accept loop and per-session tasks
//!         └── node_manager/  Reconnecting TCP link to the Node Manager
//!         ↕
//! JAUS Node Manager (binary frames over TCP)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O, no async and no knowledge of schemas.
//! - `application` depends on `domain` and `iop-core`; it reaches the Node
//!   Manager only through the `NodeManagerPort` trait.
//! - `infrastructure` depends on all other layers plus `tokio` and `tungstenite`.
//!
//! # For beginners: why this structure?
//!
//! Routing rules (who receives what, what happens when a client is slow)
//! are the interesting part of the bridge and should be testable without a
//! network.  Keeping sockets out of `application` means a test can drive a
//! [`application::Gateway`] with a mock Node Manager and plain channels.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: translation and routing.
pub mod application;

/// Infrastructure layer: WebSocket server and Node Manager link.
pub mod infrastructure;
