//! JSON frames of the client-facing WebSocket protocol.
//!
//! Clients speak JSON text frames; the Node Manager speaks binary JAUS.
//! This module owns only the JSON *envelope*.  The contents of `"fields"`
//! are schema-dependent and are checked later by the JSON mapper.
//!
//! # Client → bridge
//!
//! ```json
//! {"id": "4b00", "fields": {"type": 3, "identification": "ugv"}, "dst": "127.1.5"}
//! {"subscribe": [19200, "0x4402"]}
//! {"subscribe": null}
//! ```
//!
//! `id` is a number or a hex string (`"4b00"` or `"0x4b00"`).  `fields`
//! defaults to `{}`, `src` to the bridge's own address and `dst` to broadcast.
//!
//! # Bridge → client
//!
//! ```json
//! {"id": 19200, "fields": {...}, "src": "127.1.5", "dst": "127.100.1"}
//! {"error": {"kind": "EncodeError", "detail": "...", "refId": 19200}}
//! {"status": {"link": "connected"}}
//! {"subscribed": [19200]}
//! ```
//!
//! # For beginners: why not `#[derive(Deserialize)]` on the client frame?
//!
//! Error frames carry a `refId` naming the message a failure belongs to.
//! A derived deserializer fails all-or-nothing, so a bad `dst` would also
//! lose the (valid) `id`.  Walking the `serde_json::Value` by hand keeps
//! whatever was understood before the first problem.

use iop_core::{JausAddress, MessageId};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use thiserror::Error;

use crate::domain::link::LinkState;

// ── Client → bridge ───────────────────────────────────────────────────────────

/// A message the client wants sent to the Node Manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    pub id: MessageId,
    /// Raw JSON object; validated against the schema by the mapper.
    pub fields: Json,
    pub src: Option<JausAddress>,
    pub dst: Option<JausAddress>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Message(ClientMessage),
    /// `None` clears the filter: every message type is delivered.
    Subscribe(Option<Vec<MessageId>>),
}

/// A text frame that is not a valid client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct FrameParseError {
    /// Message id, if it was parsed before the problem was found.
    pub ref_id: Option<MessageId>,
    pub detail: String,
}

impl FrameParseError {
    fn new(ref_id: Option<MessageId>, detail: impl Into<String>) -> Self {
        Self {
            ref_id,
            detail: detail.into(),
        }
    }
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameParseError> {
        let json: Json = serde_json::from_str(text)
            .map_err(|e| FrameParseError::new(None, format!("invalid JSON: {e}")))?;
        let Json::Object(mut object) = json else {
            return Err(FrameParseError::new(None, "frame must be a JSON object"));
        };

        if let Some(filter) = object.remove("subscribe") {
            if let Some(key) = object.keys().next() {
                return Err(FrameParseError::new(
                    None,
                    format!("unexpected key `{key}` in subscribe frame"),
                ));
            }
            return parse_subscribe(&filter).map(ClientFrame::Subscribe);
        }

        let Some(raw_id) = object.remove("id") else {
            return Err(FrameParseError::new(None, "frame needs an `id` or `subscribe` key"));
        };
        let id = parse_message_id(&raw_id).map_err(|detail| FrameParseError::new(None, detail))?;
        let fail = |detail: String| FrameParseError::new(Some(id), detail);

        let fields = object.remove("fields").unwrap_or_else(|| Json::Object(Map::new()));
        let src = take_address(&mut object, "src").map_err(fail)?;
        let dst = take_address(&mut object, "dst").map_err(fail)?;

        if let Some(key) = object.keys().next() {
            return Err(fail(format!("unexpected key `{key}`")));
        }

        Ok(ClientFrame::Message(ClientMessage {
            id,
            fields,
            src,
            dst,
        }))
    }
}

/// Accepts `19200`, `"4b00"`, `"4B00"` and `"0x4b00"`.
pub fn parse_message_id(json: &Json) -> Result<MessageId, String> {
    match json {
        Json::Number(n) => n
            .as_u64()
            .and_then(|v| MessageId::try_from(v).ok())
            .ok_or_else(|| format!("message id {n} is not a 16-bit unsigned integer")),
        Json::String(s) => {
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s);
            if digits.is_empty() || digits.len() > 4 {
                return Err(format!("message id `{s}` is not 1-4 hex digits"));
            }
            MessageId::from_str_radix(digits, 16)
                .map_err(|_| format!("message id `{s}` is not a hex number"))
        }
        other => Err(format!("message id must be a number or hex string, got {other}")),
    }
}

fn parse_subscribe(json: &Json) -> Result<Option<Vec<MessageId>>, FrameParseError> {
    match json {
        Json::Null => Ok(None),
        Json::Array(items) => items
            .iter()
            .map(parse_message_id)
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
            .map_err(|detail| FrameParseError::new(None, detail)),
        _ => Err(FrameParseError::new(
            None,
            "`subscribe` must be an array of message ids or null",
        )),
    }
}

fn take_address(object: &mut Map<String, Json>, key: &str) -> Result<Option<JausAddress>, String> {
    match object.remove(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::String(text)) => text.parse().map(Some).map_err(|e| format!("`{key}`: {e}")),
        Some(other) => Err(format!("`{key}` must be a \"s.n.c\" string, got {other}")),
    }
}

// ── Bridge → client ───────────────────────────────────────────────────────────

/// Wire names of the error kinds a client can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    SchemaNotFound,
    DecodeError,
    EncodeError,
    MappingError,
    LinkDisconnected,
    SlowConsumer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(rename = "refId")]
    pub ref_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusBody {
    pub link: LinkState,
}

/// Every frame the bridge sends to a client.
///
/// `untagged` makes each variant serialize as a plain object with exactly
/// its own keys, which is what the wire format above needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Message {
        id: MessageId,
        fields: Json,
        src: JausAddress,
        dst: JausAddress,
    },
    Error {
        error: ErrorBody,
    },
    Status {
        status: StatusBody,
    },
    Subscribed {
        subscribed: Option<Vec<MessageId>>,
    },
}

impl ServerFrame {
    pub fn error(kind: ErrorKind, detail: impl Into<String>, ref_id: Option<MessageId>) -> Self {
        ServerFrame::Error {
            error: ErrorBody {
                kind,
                detail: detail.into(),
                ref_id,
            },
        }
    }

    pub fn status(link: LinkState) -> Self {
        ServerFrame::Status {
            status: StatusBody { link },
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
