//! Integration tests for the translation engine.
//!
//! These tests load the sample schema artifacts shipped in `schemas/` and
//! drive JSON → body → frame → body → JSON through the public API only.

use std::path::PathBuf;

use iop_core::protocol::transport::{encode_frame, TRANSPORT_VERSION};
use iop_core::{
    decode, encode, from_json, to_json, DecodeError, Frame, FrameBuffer, JausAddress,
    SchemaRegistry,
};
use serde_json::json;

fn sample_registry() -> SchemaRegistry {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../schemas");
    SchemaRegistry::load(dir).expect("sample schemas must load")
}

/// JSON `fields` → body bytes for message `id`.
fn encode_json(registry: &SchemaRegistry, id: u16, fields: &serde_json::Value) -> Vec<u8> {
    let schema = registry.lookup(id).expect("schema must exist");
    let instance = from_json(schema, fields).expect("fields must map");
    encode(schema, &instance).expect("instance must encode")
}

/// Body bytes → JSON `fields` for message `id`.
fn decode_json(registry: &SchemaRegistry, id: u16, body: &[u8]) -> serde_json::Value {
    let schema = registry.lookup(id).expect("schema must exist");
    let (instance, consumed) = decode(schema, body).expect("body must decode");
    assert_eq!(consumed, body.len(), "all bytes must be consumed");
    to_json(&instance)
}

#[test]
fn test_sample_artifacts_load() {
    let registry = sample_registry();
    assert_eq!(registry.len(), 13);
    assert!(registry.lookup(0x4b00).is_ok());
    assert!(registry.lookup(0x4402).is_ok());
    assert!(registry.lookup_by_name("ServiceRec").is_some());
}

#[test]
fn test_report_identification_wire_bytes() {
    // Arrange
    let registry = sample_registry();
    let fields = json!({
        "queryType": "SystemIdentification",
        "type": "VEHICLE",
        "identification": "ugv"
    });

    // Act
    let body = encode_json(&registry, 0x4b00, &fields);

    // Assert – enum u8, enum u16 (10001 LE), derived length, text
    assert_eq!(body, vec![0x01, 0x11, 0x27, 0x03, b'u', b'g', b'v']);
    assert_eq!(decode_json(&registry, 0x4b00, &body), fields);
}

#[test]
fn test_report_services_nested_round_trip() {
    let registry = sample_registry();
    let fields = json!({
        "nodes": [ {
            "nodeID": 1,
            "components": [ {
                "componentID": 1,
                "instanceID": 0,
                "services": [
                    { "uri": "urn:jaus:jss:core:Transport", "majorVersionNumber": 1, "minorVersionNumber": 0 },
                    { "uri": "urn:jaus:jss:core:Events", "majorVersionNumber": 1, "minorVersionNumber": 0 }
                ]
            } ]
        } ]
    });

    let body = encode_json(&registry, 0x4b03, &fields);

    assert_eq!(&body[..5], &[1, 1, 1, 1, 0]);
    assert_eq!(body[5], 2, "service count is derived");
    assert_eq!(decode_json(&registry, 0x4b03, &body), fields);
}

#[test]
fn test_encode_is_deterministic() {
    let registry = sample_registry();
    let fields = json!({ "subsystemID": 127, "nodeID": 1, "componentID": 5, "authorityCode": 200 });
    let first = encode_json(&registry, 0x400d, &fields);
    let second = encode_json(&registry, 0x400d, &fields);
    assert_eq!(first, second);
    assert_eq!(first, vec![127, 0, 1, 5, 200]);
}

#[test]
fn test_every_prefix_is_truncated() {
    let registry = sample_registry();
    let schema = registry.lookup(0x4b00).unwrap();
    let body = encode_json(
        &registry,
        0x4b00,
        &json!({ "queryType": "NodeIdentification", "type": "NODE", "identification": "node-1" }),
    );

    for cut in 0..body.len() {
        assert!(
            matches!(decode(schema, &body[..cut]), Err(DecodeError::Truncated { .. })),
            "prefix of {cut} bytes must be reported as truncated"
        );
    }
}

#[test]
fn test_global_pose_presence_and_scaling() {
    // Arrange – only latitude (bit 0) and yaw (bit 5) present
    let registry = sample_registry();
    let fields = json!({ "latitude": 48.1, "yaw": 1.0 });

    // Act
    let body = encode_json(&registry, 0x4402, &fields);
    let decoded = decode_json(&registry, 0x4402, &body);

    // Assert
    assert_eq!(&body[..2], &[0b0010_0001, 0x00]);
    assert_eq!(body.len(), 2 + 4 + 2);
    let latitude = decoded["latitude"].as_f64().unwrap();
    let yaw = decoded["yaw"].as_f64().unwrap();
    assert!((latitude - 48.1).abs() < 1e-6, "latitude {latitude}");
    assert!((yaw - 1.0).abs() < 1e-4, "yaw {yaw}");
    assert!(decoded.get("longitude").is_none());
    assert!(decoded.get("presenceVector").is_none());
}

#[test]
fn test_sequence_example_big_endian() {
    // Arrange
    let registry = SchemaRegistry::from_json_str(
        r#"{ "byteOrder": "big", "messages": [ { "id": 7, "name": "Values", "fields": [
            { "name": "count", "type": "u8" },
            { "name": "values", "type": "sequence", "element": { "type": "u16" }, "countField": "count" }
        ] } ] }"#,
    )
    .unwrap();
    let fields = json!({ "values": [10, 20, 30] });

    // Act
    let body = encode_json(&registry, 7, &fields);

    // Assert
    assert_eq!(body, vec![0x03, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E]);
    assert_eq!(decode_json(&registry, 7, &body), fields);
}

#[test]
fn test_body_survives_transport_framing() {
    // Arrange
    let registry = sample_registry();
    let body = encode_json(&registry, 0x000f, &json!({ "responseCode": "NOT_AVAILABLE" }));
    let frame = Frame::data(0x000f, &body, JausAddress::new(127, 100, 1), JausAddress::new(127, 1, 5));
    let mut stream = vec![TRANSPORT_VERSION];
    stream.extend(encode_frame(&frame).unwrap());

    // Act – deliver in two uneven reads
    let mut buffer = FrameBuffer::new();
    buffer.extend(&stream[..7]);
    assert!(buffer.next_frame().unwrap().is_none());
    buffer.extend(&stream[7..]);
    let received = buffer.next_frame().unwrap().expect("a whole frame");

    // Assert
    assert_eq!(received.message_id(), Some(0x000f));
    assert_eq!(
        decode_json(&registry, 0x000f, received.body()),
        json!({ "responseCode": "NOT_AVAILABLE" })
    );
}
