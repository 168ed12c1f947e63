//! # iop-core
//!
//! Message translation engine for the IOP JSON bridge.
//!
//! This crate knows nothing about sockets or tasks.  It turns the bytes of a
//! JAUS/IOP message into a JSON document and back, driven entirely by schema
//! definitions loaded at startup.
//!
//! # Architecture overview (for beginners)
//!
//! JAUS messages are compact binary structures.  Their layout is described
//! by JSIDL service definitions, which an external generator turns into a
//! JSON *schema artifact*.  Translating one message walks three layers:
//!
//! - **`schema`** – Loads the artifact, checks it for consistency and
//!   indexes the compiled [`Schema`]s by message id.
//!
//! - **`codec`** – The binary codec turns a message body into a
//!   [`MessageInstance`] (a tree of named values) and back.  The JSON mapper
//!   turns that tree into a `serde_json::Value` and back, rejecting anything
//!   the schema does not describe.
//!
//! - **`protocol`** – The JAUS TCP transport the Node Manager speaks: frame
//!   headers, JAUS addresses, sequence numbers and reassembly of frames from
//!   a byte stream.

pub mod codec;
pub mod protocol;
pub mod schema;

pub use codec::{
    decode, encode, from_json, to_json, DecodeError, EncodeError, MappingError, MessageInstance,
    Value,
};
pub use protocol::{Frame, FrameBuffer, FrameError, FrameKind, JausAddress, SequenceCounter};
pub use schema::{LookupError, MessageId, Schema, SchemaError, SchemaRegistry};
