//! Translation between client JSON frames and JAUS transport frames.
//!
//! ```text
//! outbound: ClientMessage ─lookup─▶ Schema ─from_json─▶ MessageInstance ─encode─▶ body ─▶ Frame
//! inbound:  Frame ─message_id─▶ Schema ─decode─▶ MessageInstance ─to_json─▶ ServerFrame
//! ```
//!
//! Both directions are pure functions over a shared, read-only
//! [`SchemaRegistry`]; no state, no I/O.

use iop_core::protocol::transport::MAX_FRAME_SIZE;
use iop_core::{
    decode, encode, from_json, to_json, DecodeError, EncodeError, Frame, JausAddress,
    LookupError, MappingError, MessageId, SchemaRegistry,
};
use thiserror::Error;
use tracing::warn;

use crate::application::ports::LinkError;
use crate::domain::messages::{ClientMessage, ErrorKind, FrameParseError, ServerFrame};

/// Everything that can go wrong while handling one client or Node Manager frame.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    SchemaNotFound(#[from] LookupError),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameParseError),

    #[error("encoded frame of {0} bytes exceeds the JAUS transport limit")]
    FrameTooLarge(usize),

    #[error("not a data frame")]
    NotData,

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl GatewayError {
    /// Wire name reported to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::SchemaNotFound(_) => ErrorKind::SchemaNotFound,
            GatewayError::Decode(_) | GatewayError::NotData => ErrorKind::DecodeError,
            GatewayError::Encode(_) | GatewayError::FrameTooLarge(_) => ErrorKind::EncodeError,
            GatewayError::Mapping(_) | GatewayError::InvalidFrame(_) => ErrorKind::MappingError,
            GatewayError::Link(_) => ErrorKind::LinkDisconnected,
        }
    }
}

/// Builds the data frame for a client message.
///
/// `src` defaults to `default_src` (the bridge's own address) and `dst` to
/// [`JausAddress::BROADCAST`].
pub fn translate_client_message(
    registry: &SchemaRegistry,
    message: &ClientMessage,
    default_src: JausAddress,
) -> Result<Frame, GatewayError> {
    let schema = registry.lookup(message.id)?;
    let instance = from_json(schema, &message.fields)?;
    let body = encode(schema, &instance)?;

    let frame = Frame::data(
        message.id,
        &body,
        message.src.unwrap_or(default_src),
        message.dst.unwrap_or(JausAddress::BROADCAST),
    );
    if frame.wire_size() > MAX_FRAME_SIZE {
        return Err(GatewayError::FrameTooLarge(frame.wire_size()));
    }
    Ok(frame)
}

/// Turns a data frame from the Node Manager into the JSON clients receive.
///
/// Bytes left over after the schema's last field are logged and ignored.
pub fn translate_node_manager_frame(
    registry: &SchemaRegistry,
    frame: &Frame,
) -> Result<ServerFrame, GatewayError> {
    let id: MessageId = frame.message_id().ok_or(GatewayError::NotData)?;
    let schema = registry.lookup(id)?;
    let body = frame.body();
    let (instance, consumed) = decode(schema, body)?;

    if consumed < body.len() {
        warn!(
            "message {id:#06x} ({}) from {} has {} trailing bytes; ignoring them",
            schema.name(),
            frame.source,
            body.len() - consumed
        );
    }

    Ok(ServerFrame::Message {
        id,
        fields: to_json(&instance),
        src: frame.source,
        dst: frame.destination,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use iop_core::FrameKind;
    use serde_json::json;

    const ARTIFACT: &str = r#"{
        "messages": [
            {"id": "4b00", "name": "ReportIdentification", "fields": [
                {"name": "queryType", "type": "u8"},
                {"name": "type", "type": "u16"},
                {"name": "idLength", "type": "u8"},
                {"name": "identification", "type": "string", "countField": "idLength"}
            ]},
            {"id": "2b00", "name": "QueryIdentification", "fields": [
                {"name": "queryType", "type": "u8"}
            ]}
        ]
    }"#;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_json_str(ARTIFACT).unwrap()
    }

    fn client(id: MessageId, fields: serde_json::Value) -> ClientMessage {
        ClientMessage {
            id,
            fields,
            src: None,
            dst: None,
        }
    }

    #[test]
    fn test_outbound_uses_defaults_for_addresses() {
        // Arrange
        let local = JausAddress::new(127, 100, 1);

        // Act
        let frame =
            translate_client_message(&registry(), &client(0x2b00, json!({"queryType": 1})), local)
                .unwrap();

        // Assert
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.message_id(), Some(0x2b00));
        assert_eq!(frame.body(), &[1]);
        assert_eq!(frame.source, local);
        assert_eq!(frame.destination, JausAddress::BROADCAST);
    }

    #[test]
    fn test_outbound_honours_explicit_addresses() {
        let mut message = client(0x2b00, json!({"queryType": 0}));
        message.src = Some(JausAddress::new(5, 5, 5));
        message.dst = Some(JausAddress::new(6, 6, 6));

        let frame = translate_client_message(&registry(), &message, JausAddress::new(1, 1, 1)).unwrap();

        assert_eq!(frame.source, JausAddress::new(5, 5, 5));
        assert_eq!(frame.destination, JausAddress::new(6, 6, 6));
    }

    #[test]
    fn test_outbound_error_kinds() {
        let local = JausAddress::new(1, 1, 1);
        let reg = registry();

        let unknown = translate_client_message(&reg, &client(0x9999, json!({})), local).unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::SchemaNotFound);

        let bad_field =
            translate_client_message(&reg, &client(0x2b00, json!({"queryTyp": 1})), local).unwrap_err();
        assert_eq!(bad_field.kind(), ErrorKind::MappingError);

        let out_of_range =
            translate_client_message(&reg, &client(0x2b00, json!({"queryType": 256})), local).unwrap_err();
        assert_eq!(out_of_range.kind(), ErrorKind::MappingError);
    }

    #[test]
    fn test_inbound_maps_body_and_addresses() {
        // Arrange
        let frame = Frame::data(
            0x4b00,
            &[0x01, 0x11, 0x27, 0x03, b'u', b'g', b'v'],
            JausAddress::new(127, 1, 5),
            JausAddress::new(127, 100, 1),
        );

        // Act
        let out = translate_node_manager_frame(&registry(), &frame).unwrap();

        // Assert
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({
                "id": 0x4b00,
                "fields": {"queryType": 1, "type": 10001, "identification": "ugv"},
                "src": "127.1.5",
                "dst": "127.100.1"
            })
        );
    }

    #[test]
    fn test_inbound_tolerates_trailing_bytes() {
        let frame = Frame::data(0x2b00, &[2, 0xAA, 0xBB], JausAddress::new(1, 1, 1), JausAddress::BROADCAST);
        let out = translate_node_manager_frame(&registry(), &frame).unwrap();
        match out {
            ServerFrame::Message { fields, .. } => assert_eq!(fields, json!({"queryType": 2})),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_inbound_error_kinds() {
        let reg = registry();
        let addr = JausAddress::new(1, 1, 1);

        let truncated = Frame::data(0x4b00, &[0x01, 0x11], addr, addr);
        assert_eq!(
            translate_node_manager_frame(&reg, &truncated).unwrap_err().kind(),
            ErrorKind::DecodeError
        );

        let unknown = Frame::data(0x0001, &[], addr, addr);
        assert_eq!(
            translate_node_manager_frame(&reg, &unknown).unwrap_err().kind(),
            ErrorKind::SchemaNotFound
        );

        let accept = Frame::command(FrameKind::Accept, addr);
        assert!(matches!(
            translate_node_manager_frame(&reg, &accept),
            Err(GatewayError::NotData)
        ));
    }
}
