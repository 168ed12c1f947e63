//! JSON mapping for message instances.
//!
//! # Conventions
//!
//! | Field kind            | JSON                                   |
//! |-----------------------|----------------------------------------|
//! | integers              | number, range-checked                  |
//! | `f32` / `f64`/`scaled`| number (`null` for NaN and infinities) |
//! | `bool`                | `true` / `false`                       |
//! | `bytes`               | array of numbers `0..=255`             |
//! | strings               | string                                 |
//! | `enum`                | enumerant name as a string             |
//! | `record`              | object                                 |
//! | `sequence` / `array`  | array                                  |
//! | `bitField`            | object of sub-field integers or names  |
//! | `variant`             | `{ "<option>": value }`, one key       |
//!
//! Count and presence fields are derived by the binary codec, so they never
//! appear in [`to_json`] output.  [`from_json`] tolerates them (clients may
//! echo a decoded message back) and ignores their values.  A `null` value
//! for an optional field means the field is absent.
//!
//! A `null` for a required `f32`/`f64` field or element reads back as NaN,
//! so a non-finite float that was decoded and rendered as `null` can be
//! sent again.  The sign and infinities are not preserved.  Scaled fields
//! have no NaN on the wire and still require a number.

use serde_json::{Map, Number, Value as Json};
use thiserror::Error;

use crate::codec::value::{MessageInstance, Value};
use crate::schema::{FieldKind, IntKind, Schema, SubField};

/// Root of every path reported by [`from_json`].
pub const ROOT_PATH: &str = "fields";

/// A JSON document that does not fit the schema.
///
/// `path` locates the offending value, e.g. `fields.items[2].speed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{path}: expected a JSON object")]
    NotAnObject { path: String },

    #[error("{path}: missing required field")]
    MissingField { path: String },

    #[error("{path}: unknown field")]
    UnknownField { path: String },

    #[error("{path}: expected {expected}")]
    InvalidValue { path: String, expected: String },

    #[error("{path}: value does not fit {kind}")]
    OutOfRange { path: String, kind: String },

    #[error("{path}: unknown enum name `{name}`")]
    UnknownEnumName { path: String, name: String },
}

/// Renders a message instance as a JSON object.
pub fn to_json(instance: &MessageInstance) -> Json {
    let mut map = Map::new();
    for (name, value) in instance.iter() {
        map.insert(name.to_string(), value_to_json(value));
    }
    Json::Object(map)
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Unsigned(v) => Json::from(*v),
        Value::Signed(v) => Json::from(*v),
        Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::Bool(b) => Json::Bool(*b),
        Value::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        Value::Text(s) | Value::Enum(s) => Json::String(s.clone()),
        Value::Record(nested) => to_json(nested),
        Value::Sequence(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Variant(name, inner) => {
            let mut map = Map::new();
            map.insert(name.clone(), value_to_json(inner));
            Json::Object(map)
        }
    }
}

/// Builds a message instance for `schema` from the client's `fields` object.
pub fn from_json(schema: &Schema, json: &Json) -> Result<MessageInstance, MappingError> {
    object_to_instance(schema, json, ROOT_PATH)
}

fn child(path: &str, name: &str) -> String {
    format!("{path}.{name}")
}

fn invalid(path: &str, expected: impl Into<String>) -> MappingError {
    MappingError::InvalidValue {
        path: path.to_string(),
        expected: expected.into(),
    }
}

fn object_to_instance(
    schema: &Schema,
    json: &Json,
    path: &str,
) -> Result<MessageInstance, MappingError> {
    let Json::Object(object) = json else {
        return Err(MappingError::NotAnObject {
            path: path.to_string(),
        });
    };

    if let Some(unknown) = object.keys().find(|key| schema.field(key).is_none()) {
        return Err(MappingError::UnknownField {
            path: child(path, unknown),
        });
    }

    let mut instance = MessageInstance::new();
    for field in schema.fields().iter().filter(|f| !f.is_derived()) {
        let field_path = child(path, &field.name);
        match object.get(&field.name) {
            None | Some(Json::Null) if field.optional => continue,
            None => return Err(MappingError::MissingField { path: field_path }),
            Some(Json::Null) if !matches!(field.kind, FieldKind::Float(_)) => {
                return Err(MappingError::MissingField { path: field_path })
            }
            Some(json) => {
                let value = json_to_value(&field.kind, json, &field_path)?;
                instance.insert(field.name.clone(), value);
            }
        }
    }
    Ok(instance)
}

fn json_to_value(kind: &FieldKind, json: &Json, path: &str) -> Result<Value, MappingError> {
    let value = match kind {
        FieldKind::Int(k) | FieldKind::PresenceVector(k) => json_to_int(*k, json, path)?,
        FieldKind::Float(_) if json.is_null() => Value::Float(f64::NAN),
        FieldKind::Float(_) | FieldKind::Scaled { .. } => {
            Value::Float(json.as_f64().ok_or_else(|| invalid(path, "a number"))?)
        }
        FieldKind::Bool => Value::Bool(json.as_bool().ok_or_else(|| invalid(path, "a boolean"))?),
        FieldKind::Bytes { length } => {
            let expected = || format!("an array of {length} bytes");
            let items = json.as_array().ok_or_else(|| invalid(path, expected()))?;
            if items.len() != *length {
                return Err(invalid(path, expected()));
            }
            let bytes = items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| invalid(&format!("{path}[{i}]"), "a byte (0-255)"))
                })
                .collect::<Result<Vec<u8>, _>>()?;
            Value::Bytes(bytes)
        }
        FieldKind::FixedString { length } => {
            let text = json.as_str().ok_or_else(|| invalid(path, "a string"))?;
            if text.len() > *length {
                return Err(invalid(path, format!("a string of at most {length} bytes")));
            }
            Value::Text(text.to_string())
        }
        FieldKind::String { .. } => {
            Value::Text(json.as_str().ok_or_else(|| invalid(path, "a string"))?.to_string())
        }
        FieldKind::Sequence { element, .. } => {
            let items = json.as_array().ok_or_else(|| invalid(path, "an array"))?;
            let values = items
                .iter()
                .enumerate()
                .map(|(i, item)| json_to_value(element, item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Value::Sequence(values)
        }
        FieldKind::Record(schema) => Value::Record(object_to_instance(schema, json, path)?),
        FieldKind::Enum { values, .. } => {
            let name = json.as_str().ok_or_else(|| invalid(path, "an enum name"))?;
            if !values.iter().any(|e| e.name == name) {
                return Err(MappingError::UnknownEnumName {
                    path: path.to_string(),
                    name: name.to_string(),
                });
            }
            Value::Enum(name.to_string())
        }
        FieldKind::Array { element, length } => {
            let items = json
                .as_array()
                .filter(|items| items.len() == *length)
                .ok_or_else(|| invalid(path, format!("an array of {length} items")))?;
            let values = items
                .iter()
                .enumerate()
                .map(|(i, item)| json_to_value(element, item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Value::Sequence(values)
        }
        FieldKind::BitField { subfields, .. } => {
            Value::Record(json_to_bit_field(subfields, json, path)?)
        }
        FieldKind::Variant { options, .. } => {
            let expected = "an object with exactly one variant option";
            let (name, inner) = json
                .as_object()
                .filter(|object| object.len() == 1)
                .and_then(|object| object.iter().next())
                .ok_or_else(|| invalid(path, expected))?;
            let option_path = child(path, name);
            let option = options
                .iter()
                .find(|o| o.name == *name)
                .ok_or_else(|| MappingError::UnknownField {
                    path: option_path.clone(),
                })?;
            let value = json_to_value(&option.kind, inner, &option_path)?;
            Value::Variant(name.clone(), Box::new(value))
        }
    };
    Ok(value)
}

fn json_to_bit_field(
    subfields: &[SubField],
    json: &Json,
    path: &str,
) -> Result<MessageInstance, MappingError> {
    let Json::Object(object) = json else {
        return Err(MappingError::NotAnObject {
            path: path.to_string(),
        });
    };
    if let Some(unknown) = object
        .keys()
        .find(|key| !subfields.iter().any(|s| s.name == **key))
    {
        return Err(MappingError::UnknownField {
            path: child(path, unknown),
        });
    }

    let mut parts = MessageInstance::new();
    for sub in subfields {
        let sub_path = child(path, &sub.name);
        let json = match object.get(&sub.name) {
            None | Some(Json::Null) => return Err(MappingError::MissingField { path: sub_path }),
            Some(json) => json,
        };
        let value = if sub.values.is_empty() {
            let bits = json
                .as_u64()
                .ok_or_else(|| invalid(&sub_path, "an unsigned integer"))?;
            if bits > sub.max() {
                return Err(MappingError::OutOfRange {
                    path: sub_path,
                    kind: format!("{}-bit field", sub.width()),
                });
            }
            Value::Unsigned(bits)
        } else {
            let name = json.as_str().ok_or_else(|| invalid(&sub_path, "an enum name"))?;
            if !sub.values.iter().any(|e| e.name == name) {
                return Err(MappingError::UnknownEnumName {
                    path: sub_path,
                    name: name.to_string(),
                });
            }
            Value::Enum(name.to_string())
        };
        parts.insert(sub.name.clone(), value);
    }
    Ok(parts)
}

fn json_to_int(kind: IntKind, json: &Json, path: &str) -> Result<Value, MappingError> {
    let Json::Number(n) = json else {
        return Err(invalid(path, "an integer"));
    };

    let wide: i128 = if let Some(u) = n.as_u64() {
        i128::from(u)
    } else if let Some(i) = n.as_i64() {
        i128::from(i)
    } else {
        // Accept integral floats such as `3.0`; anything else is not an integer.
        match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1.8e19 => f as i128,
            _ => return Err(invalid(path, "an integer")),
        }
    };

    if !kind.contains(wide) {
        return Err(MappingError::OutOfRange {
            path: path.to_string(),
            kind: kind.to_string(),
        });
    }
    Ok(if kind.is_signed() {
        Value::Signed(wide as i64)
    } else {
        Value::Unsigned(wide as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    fn drive_registry() -> SchemaRegistry {
        SchemaRegistry::from_json_str(
            r#"{
                "records": [ { "name": "Wheel", "fields": [
                    { "name": "speed", "type": "u8" },
                    { "name": "mode", "type": "enum", "base": "u8",
                      "values": [ { "name": "Idle", "value": 0 }, { "name": "Run", "value": 1 } ] }
                ] } ],
                "messages": [ { "id": 1, "name": "Drive", "fields": [
                    { "name": "pv", "type": "presenceVector", "base": "u8" },
                    { "name": "n", "type": "u8" },
                    { "name": "items", "type": "sequence", "countField": "n",
                      "element": { "type": "record", "ref": "Wheel" } },
                    { "name": "tag", "type": "bytes", "length": 2 },
                    { "name": "heading", "type": "f32", "optional": true }
                ] } ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_from_json_builds_nested_instance() {
        // Arrange
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        let fields = json!({
            "items": [ { "speed": 3, "mode": "Run" } ],
            "tag": [1, 255]
        });

        // Act
        let instance = from_json(schema, &fields).unwrap();

        // Assert
        let expected = MessageInstance::new()
            .with(
                "items",
                Value::Sequence(vec![Value::Record(
                    MessageInstance::new()
                        .with("speed", Value::Unsigned(3))
                        .with("mode", Value::Enum("Run".into())),
                )]),
            )
            .with("tag", Value::Bytes(vec![1, 255]));
        assert_eq!(instance, expected);
        assert_eq!(to_json(&instance), fields);
    }

    #[test]
    fn test_error_path_points_into_sequence() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        let fields = json!({
            "items": [ { "speed": 1, "mode": "Idle" }, { "speed": 1, "mode": "Idle" },
                       { "speed": 300, "mode": "Idle" } ],
            "tag": [0, 0]
        });
        assert_eq!(
            from_json(schema, &fields),
            Err(MappingError::OutOfRange {
                path: "fields.items[2].speed".into(),
                kind: "u8".into()
            })
        );
    }

    #[test]
    fn test_unknown_and_missing_fields() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();

        let unknown = json!({ "items": [], "tag": [0, 0], "colour": "red" });
        assert_eq!(
            from_json(schema, &unknown),
            Err(MappingError::UnknownField {
                path: "fields.colour".into()
            })
        );

        let missing = json!({ "items": [] });
        assert_eq!(
            from_json(schema, &missing),
            Err(MappingError::MissingField {
                path: "fields.tag".into()
            })
        );
    }

    #[test]
    fn test_derived_keys_are_ignored_and_null_means_absent() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        let fields = json!({ "pv": 9, "n": 42, "items": [], "tag": [0, 0], "heading": null });

        let instance = from_json(schema, &fields).unwrap();

        assert!(!instance.contains("n"));
        assert!(!instance.contains("pv"));
        assert!(!instance.contains("heading"));
    }

    #[test]
    fn test_enum_requires_known_name() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        let numeric = json!({ "items": [ { "speed": 1, "mode": 1 } ], "tag": [0, 0] });
        let unknown = json!({ "items": [ { "speed": 1, "mode": "Fly" } ], "tag": [0, 0] });

        assert!(matches!(
            from_json(schema, &numeric),
            Err(MappingError::InvalidValue { .. })
        ));
        assert_eq!(
            from_json(schema, &unknown),
            Err(MappingError::UnknownEnumName {
                path: "fields.items[0].mode".into(),
                name: "Fly".into()
            })
        );
    }

    #[test]
    fn test_bytes_must_have_declared_length() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        let short = json!({ "items": [], "tag": [1] });
        let not_byte = json!({ "items": [], "tag": [1, 256] });

        assert!(matches!(from_json(schema, &short), Err(MappingError::InvalidValue { .. })));
        assert_eq!(
            from_json(schema, &not_byte),
            Err(MappingError::InvalidValue {
                path: "fields.tag[1]".into(),
                expected: "a byte (0-255)".into()
            })
        );
    }

    #[test]
    fn test_fields_must_be_an_object() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        assert_eq!(
            from_json(schema, &json!([1, 2])),
            Err(MappingError::NotAnObject {
                path: "fields".into()
            })
        );
    }

    #[test]
    fn test_nan_survives_a_trip_through_null() {
        // Arrange
        let reg = SchemaRegistry::from_json_str(
            r#"{ "messages": [ { "id": 1, "name": "Reading", "fields": [
                { "name": "value", "type": "f64" },
                { "name": "n", "type": "u8" },
                { "name": "samples", "type": "sequence", "countField": "n",
                  "element": { "type": "f32" } } ] } ] }"#,
        )
        .unwrap();
        let schema = reg.lookup(1).unwrap();
        let decoded = MessageInstance::new()
            .with("value", Value::Float(f64::NAN))
            .with("samples", Value::Sequence(vec![Value::Float(f64::INFINITY)]));

        // Act
        let rendered = to_json(&decoded);
        let parsed = from_json(schema, &rendered).unwrap();

        // Assert
        assert_eq!(rendered, json!({ "value": null, "samples": [null] }));
        assert!(matches!(parsed.get("value"), Some(Value::Float(v)) if v.is_nan()));
        let Some(Value::Sequence(samples)) = parsed.get("samples") else {
            panic!("expected a sequence");
        };
        assert!(matches!(samples[0], Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_null_still_means_missing_for_other_required_kinds() {
        let reg = drive_registry();
        let schema = reg.lookup(1).unwrap();
        let fields = json!({ "items": [], "tag": null });
        assert_eq!(
            from_json(schema, &fields),
            Err(MappingError::MissingField {
                path: "fields.tag".into()
            })
        );
    }

    fn layout_registry() -> SchemaRegistry {
        SchemaRegistry::from_json_str(
            r#"{ "messages": [ { "id": 1, "name": "Layout", "fields": [
                { "name": "flags", "type": "bitField", "base": "u16", "subfields": [
                    { "name": "level", "from": 0, "to": 3 },
                    { "name": "mode", "from": 4, "to": 5,
                      "values": [ { "name": "Idle", "value": 0 }, { "name": "Run", "value": 1 } ] } ] },
                { "name": "target", "type": "variant", "selector": "u8", "options": [
                    { "name": "id", "type": "u16" },
                    { "name": "name", "type": "fixedString", "length": 8 } ] },
                { "name": "axes", "type": "array", "length": 2, "element": { "type": "i8" } }
            ] } ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_bit_field_variant_and_array_map_to_json() {
        // Arrange
        let reg = layout_registry();
        let schema = reg.lookup(1).unwrap();
        let fields = json!({
            "flags": { "level": 15, "mode": "Run" },
            "target": { "name": "ugv-1" },
            "axes": [-1, 1]
        });

        // Act
        let instance = from_json(schema, &fields).unwrap();

        // Assert
        assert_eq!(
            instance.get("flags"),
            Some(&Value::Record(
                MessageInstance::new()
                    .with("level", Value::Unsigned(15))
                    .with("mode", Value::Enum("Run".into()))
            ))
        );
        assert_eq!(
            instance.get("target"),
            Some(&Value::Variant("name".into(), Box::new(Value::Text("ugv-1".into()))))
        );
        assert_eq!(to_json(&instance), fields);
    }

    #[test]
    fn test_bit_field_variant_and_array_errors() {
        let reg = layout_registry();
        let schema = reg.lookup(1).unwrap();
        let base = json!({
            "flags": { "level": 1, "mode": "Idle" },
            "target": { "id": 7 },
            "axes": [0, 0]
        });
        let with = |key: &str, value: Json| {
            let mut fields = base.clone();
            fields[key] = value;
            fields
        };

        assert_eq!(
            from_json(schema, &with("flags", json!({ "level": 16, "mode": "Idle" }))),
            Err(MappingError::OutOfRange {
                path: "fields.flags.level".into(),
                kind: "4-bit field".into()
            })
        );
        assert_eq!(
            from_json(schema, &with("flags", json!({ "level": 1 }))),
            Err(MappingError::MissingField {
                path: "fields.flags.mode".into()
            })
        );
        assert_eq!(
            from_json(schema, &with("target", json!({ "serial": 7 }))),
            Err(MappingError::UnknownField {
                path: "fields.target.serial".into()
            })
        );
        assert!(matches!(
            from_json(schema, &with("target", json!({ "id": 7, "name": "x" }))),
            Err(MappingError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_json(schema, &with("axes", json!([0, 0, 0]))),
            Err(MappingError::InvalidValue { .. })
        ));
        assert!(from_json(schema, &base).is_ok());
    }

    #[test]
    fn test_non_finite_float_serializes_as_null() {
        let instance = MessageInstance::new()
            .with("a", Value::Float(f64::NAN))
            .with("b", Value::Float(1.5));
        assert_eq!(to_json(&instance), json!({ "a": null, "b": 1.5 }));
    }

    #[test]
    fn test_integral_float_is_accepted_for_integer() {
        assert_eq!(json_to_int(IntKind::I16, &json!(-3.0), "p"), Ok(Value::Signed(-3)));
        assert!(json_to_int(IntKind::I16, &json!(2.5), "p").is_err());
        assert!(json_to_int(IntKind::U8, &json!("7"), "p").is_err());
    }
}
