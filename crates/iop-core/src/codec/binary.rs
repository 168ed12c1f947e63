//! Schema-driven binary codec for JAUS message bodies.
//!
//! The body is the part of a data frame that follows the two-byte message id.
//! Fields are laid out back to back in schema order with no padding:
//!
//! ```text
//! [field 0][field 1]...[field N-1]
//! ```
//!
//! - Fixed-width values use the schema's byte order.
//! - `string` and `sequence` fields take their length from a count field that
//!   was decoded earlier in the same record.  An `array` has its length in the
//!   schema and no count on the wire.
//! - A `bitField` is one unsigned integer; its sub-fields decode to a nested
//!   instance keyed by sub-field name.
//! - A `variant` is its selector integer (the option's index) followed by
//!   the selected option.
//! - Optional fields are written only when their bit in the presence vector
//!   is set (bit *i* belongs to the *i*-th optional field).
//! - Count and presence fields are derived on encode and never appear in a
//!   decoded [`MessageInstance`].
//!
//! Decoding never reads past the input and never allocates more than the
//! input could possibly describe, so any truncated or hostile buffer ends in
//! a [`DecodeError`].

use thiserror::Error;

use crate::codec::value::{MessageInstance, Value};
use crate::schema::{
    ByteOrder, FieldDescriptor, FieldKind, FieldRole, FloatKind, IntKind, Schema, SubField,
};

/// Errors produced while decoding a message body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended before the message did.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("field `{field}`: unknown enumerant {value}")]
    UnknownEnumerant { field: String, value: i128 },

    /// A count field holds a value that cannot be a length (negative, or
    /// larger than the address space).
    #[error("field `{field}`: {length} is not a valid length")]
    MalformedLength { field: String, length: i128 },

    #[error("field `{field}`: invalid bool byte {value:#04x}")]
    InvalidBool { field: String, value: u8 },

    #[error("field `{field}`: text is not valid UTF-8")]
    InvalidUtf8 { field: String },

    #[error("field `{field}`: selector {selector} names no variant option")]
    UnknownVariant { field: String, selector: i128 },
}

/// Errors produced while encoding a message instance.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{0}` is not part of the schema")]
    UnexpectedField(String),

    #[error("field `{field}`: expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: &'static str,
    },

    #[error("field `{field}`: value does not fit {kind}")]
    OutOfRange { field: String, kind: String },

    #[error("field `{field}`: expected length {expected}, found {actual}")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("field `{field}`: unknown enum name `{name}`")]
    UnknownEnumName { field: String, name: String },

    #[error("field `{field}`: unknown variant option `{name}`")]
    UnknownVariant { field: String, name: String },

    #[error("count field `{field}`: governed fields disagree on length ({first} vs {second})")]
    CountConflict {
        field: String,
        first: usize,
        second: usize,
    },

    #[error("count field `{field}`: length {length} does not fit {kind}")]
    CountOverflow {
        field: String,
        length: usize,
        kind: IntKind,
    },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Decodes one message body from the start of `bytes`.
///
/// Returns the instance and the number of bytes consumed.  Bytes after the
/// message are left for the caller to judge.
pub fn decode(schema: &Schema, bytes: &[u8]) -> Result<(MessageInstance, usize), DecodeError> {
    let mut reader = Reader {
        buf: bytes,
        pos: 0,
        order: schema.byte_order(),
    };
    let instance = decode_record(schema, &mut reader, "")?;
    Ok((instance, reader.pos))
}

/// Encodes a message instance into its body bytes.
pub fn encode(schema: &Schema, instance: &MessageInstance) -> Result<Vec<u8>, EncodeError> {
    let mut writer = Writer {
        buf: Vec::with_capacity(schema.min_wire_size()),
        order: schema.byte_order(),
    };
    encode_record(schema, instance, &mut writer, "")?;
    Ok(writer.buf)
}

fn child(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: self.pos.saturating_add(n),
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads `width` bytes as an unsigned integer in the configured byte order.
    fn read_bits(&mut self, width: usize) -> Result<u128, DecodeError> {
        let bytes = self.take(width)?;
        let mut le = [0u8; 16];
        match self.order {
            ByteOrder::Little => le[..width].copy_from_slice(bytes),
            ByteOrder::Big => {
                for (dst, src) in le.iter_mut().zip(bytes.iter().rev()) {
                    *dst = *src;
                }
            }
        }
        Ok(u128::from_le_bytes(le))
    }

    fn read_int(&mut self, kind: IntKind) -> Result<i128, DecodeError> {
        let raw = self.read_bits(kind.width())?;
        if kind.is_signed() {
            let shift = 128 - kind.width() * 8;
            Ok(((raw << shift) as i128) >> shift)
        } else {
            Ok(raw as i128)
        }
    }
}

fn int_value(kind: IntKind, raw: i128) -> Value {
    if kind.is_signed() {
        Value::Signed(raw as i64)
    } else {
        Value::Unsigned(raw as u64)
    }
}

fn decode_record(
    schema: &Schema,
    reader: &mut Reader<'_>,
    path: &str,
) -> Result<MessageInstance, DecodeError> {
    let mut instance = MessageInstance::new();
    let mut counts: Vec<(&str, usize)> = Vec::new();
    let mut presence: u64 = 0;
    let mut optional_index = 0u32;

    for field in schema.fields() {
        if field.optional {
            let bit = optional_index;
            optional_index += 1;
            if presence & (1u64 << bit) == 0 {
                continue;
            }
        }

        let field_path = child(path, &field.name);
        match field.role {
            FieldRole::Count => {
                let raw = read_integer_base(field, reader, &field_path)?;
                let length = usize::try_from(raw).map_err(|_| DecodeError::MalformedLength {
                    field: field_path,
                    length: raw,
                })?;
                counts.push((&field.name, length));
            }
            FieldRole::Presence => {
                presence = read_integer_base(field, reader, &field_path)? as u64;
            }
            FieldRole::Value => {
                let count = field
                    .kind
                    .count_field()
                    .and_then(|name| counts.iter().find(|(n, _)| *n == name))
                    .map(|(_, length)| *length)
                    .unwrap_or(0);
                let value = decode_value(&field.kind, count, reader, &field_path)?;
                instance.insert(field.name.clone(), value);
            }
        }
    }
    Ok(instance)
}

fn read_integer_base(
    field: &FieldDescriptor,
    reader: &mut Reader<'_>,
    path: &str,
) -> Result<i128, DecodeError> {
    match field.kind.integer_base() {
        Some(kind) => reader.read_int(kind),
        None => Err(DecodeError::MalformedLength {
            field: path.to_string(),
            length: 0,
        }),
    }
}

fn decode_value(
    kind: &FieldKind,
    count: usize,
    reader: &mut Reader<'_>,
    path: &str,
) -> Result<Value, DecodeError> {
    let value = match kind {
        FieldKind::Int(k) | FieldKind::PresenceVector(k) => int_value(*k, reader.read_int(*k)?),
        FieldKind::Float(FloatKind::F32) => {
            Value::Float(f64::from(f32::from_bits(reader.read_bits(4)? as u32)))
        }
        FieldKind::Float(FloatKind::F64) => {
            Value::Float(f64::from_bits(reader.read_bits(8)? as u64))
        }
        FieldKind::Bool => match reader.take(1)?[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(DecodeError::InvalidBool {
                    field: path.to_string(),
                    value: other,
                })
            }
        },
        FieldKind::Bytes { length } => Value::Bytes(reader.take(*length)?.to_vec()),
        FieldKind::FixedString { length } => {
            let raw = reader.take(*length)?;
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            Value::Text(utf8(&raw[..end], path)?)
        }
        FieldKind::String { .. } => Value::Text(utf8(reader.take(count)?, path)?),
        FieldKind::Sequence { element, .. } => {
            // Registries refuse zero-width elements; a hand-built schema
            // still must not turn a wire count into a huge loop.
            if element.min_wire_size() == 0 && count > reader.remaining() {
                return Err(DecodeError::MalformedLength {
                    field: path.to_string(),
                    length: count as i128,
                });
            }
            let needed = count.saturating_mul(element.min_wire_size());
            if needed > reader.remaining() {
                return Err(DecodeError::Truncated {
                    needed: reader.pos.saturating_add(needed),
                    available: reader.buf.len(),
                });
            }
            let mut items = Vec::with_capacity(count.min(reader.remaining()));
            for i in 0..count {
                items.push(decode_value(element, 0, reader, &format!("{path}[{i}]"))?);
            }
            Value::Sequence(items)
        }
        FieldKind::Record(schema) => Value::Record(decode_record(schema, reader, path)?),
        FieldKind::Enum { base, values } => {
            let raw = reader.read_int(*base)?;
            match values.iter().find(|e| i128::from(e.value) == raw) {
                Some(e) => Value::Enum(e.name.clone()),
                None => {
                    return Err(DecodeError::UnknownEnumerant {
                        field: path.to_string(),
                        value: raw,
                    })
                }
            }
        }
        FieldKind::Scaled { base, scale } => Value::Float(scale.to_real(reader.read_int(*base)?)),
        FieldKind::Array { element, length } => {
            let mut items = Vec::with_capacity((*length).min(reader.remaining()));
            for i in 0..*length {
                items.push(decode_value(element, 0, reader, &format!("{path}[{i}]"))?);
            }
            Value::Sequence(items)
        }
        FieldKind::BitField { base, subfields } => {
            let raw = reader.read_int(*base)? as u64;
            Value::Record(decode_bit_field(subfields, raw, path)?)
        }
        FieldKind::Variant { selector, options } => {
            let raw = reader.read_int(*selector)?;
            let option = usize::try_from(raw)
                .ok()
                .and_then(|index| options.get(index))
                .ok_or_else(|| DecodeError::UnknownVariant {
                    field: path.to_string(),
                    selector: raw,
                })?;
            let inner = decode_value(&option.kind, 0, reader, &child(path, &option.name))?;
            Value::Variant(option.name.clone(), Box::new(inner))
        }
    };
    Ok(value)
}

fn decode_bit_field(
    subfields: &[SubField],
    raw: u64,
    path: &str,
) -> Result<MessageInstance, DecodeError> {
    let mut parts = MessageInstance::new();
    for sub in subfields {
        let bits = sub.extract(raw);
        let value = if sub.values.is_empty() {
            Value::Unsigned(bits)
        } else {
            match sub.values.iter().find(|e| u64::try_from(e.value) == Ok(bits)) {
                Some(e) => Value::Enum(e.name.clone()),
                None => {
                    return Err(DecodeError::UnknownEnumerant {
                        field: child(path, &sub.name),
                        value: i128::from(bits),
                    })
                }
            }
        };
        parts.insert(sub.name.clone(), value);
    }
    Ok(parts)
}

fn utf8(bytes: &[u8], path: &str) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 {
        field: path.to_string(),
    })
}

// ── Encoding ──────────────────────────────────────────────────────────────────

struct Writer {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Writer {
    /// Writes the low `width` bytes of `value` (two's complement) in byte order.
    fn write_bits(&mut self, value: i128, width: usize) {
        let le = value.to_le_bytes();
        match self.order {
            ByteOrder::Little => self.buf.extend_from_slice(&le[..width]),
            ByteOrder::Big => self.buf.extend(le[..width].iter().rev()),
        }
    }
}

fn encode_record(
    schema: &Schema,
    instance: &MessageInstance,
    writer: &mut Writer,
    path: &str,
) -> Result<(), EncodeError> {
    for (name, _) in instance.iter() {
        if schema.field(name).is_none() {
            return Err(EncodeError::UnexpectedField(child(path, name)));
        }
    }

    let presence = presence_bits(schema, instance);
    let mut optional_index = 0u32;

    for field in schema.fields() {
        let field_path = child(path, &field.name);
        if field.optional {
            let bit = optional_index;
            optional_index += 1;
            if presence & (1u64 << bit) == 0 {
                continue;
            }
        }

        match field.role {
            FieldRole::Count => {
                let kind = integer_base(field, &field_path)?;
                let length = derived_count(schema, field, instance, path)?;
                if !kind.contains(length as i128) {
                    return Err(EncodeError::CountOverflow {
                        field: field_path,
                        length,
                        kind,
                    });
                }
                writer.write_bits(length as i128, kind.width());
            }
            FieldRole::Presence => {
                let kind = integer_base(field, &field_path)?;
                writer.write_bits(i128::from(presence), kind.width());
            }
            FieldRole::Value => {
                let value = instance
                    .get(&field.name)
                    .ok_or_else(|| EncodeError::MissingField(field_path.clone()))?;
                encode_value(&field.kind, value, writer, &field_path)?;
            }
        }
    }
    Ok(())
}

fn integer_base(field: &FieldDescriptor, path: &str) -> Result<IntKind, EncodeError> {
    field
        .kind
        .integer_base()
        .ok_or_else(|| EncodeError::TypeMismatch {
            field: path.to_string(),
            expected: "integer".to_string(),
            found: "non-integer field",
        })
}

fn presence_bits(schema: &Schema, instance: &MessageInstance) -> u64 {
    schema
        .fields()
        .iter()
        .filter(|f| f.optional)
        .enumerate()
        .filter(|(_, f)| instance.contains(&f.name))
        .fold(0u64, |bits, (i, _)| bits | (1u64 << i))
}

/// Length shared by every present field governed by `count`.
fn derived_count(
    schema: &Schema,
    count: &FieldDescriptor,
    instance: &MessageInstance,
    path: &str,
) -> Result<usize, EncodeError> {
    let mut length: Option<usize> = None;
    let governed = schema
        .fields()
        .iter()
        .filter(|f| f.kind.count_field() == Some(count.name.as_str()));

    for field in governed {
        let Some(value) = instance.get(&field.name) else {
            continue;
        };
        let len = match value {
            Value::Text(s) => s.len(),
            Value::Sequence(items) => items.len(),
            other => {
                return Err(EncodeError::TypeMismatch {
                    field: child(path, &field.name),
                    expected: field.kind.describe(),
                    found: other.type_name(),
                })
            }
        };
        match length {
            Some(first) if first != len => {
                return Err(EncodeError::CountConflict {
                    field: child(path, &count.name),
                    first,
                    second: len,
                })
            }
            _ => length = Some(len),
        }
    }
    Ok(length.unwrap_or(0))
}

fn encode_value(
    kind: &FieldKind,
    value: &Value,
    writer: &mut Writer,
    path: &str,
) -> Result<(), EncodeError> {
    let mismatch = || EncodeError::TypeMismatch {
        field: path.to_string(),
        expected: kind.describe(),
        found: value.type_name(),
    };

    match kind {
        FieldKind::Int(k) | FieldKind::PresenceVector(k) => {
            let raw = value.as_i128().ok_or_else(mismatch)?;
            if !k.contains(raw) {
                return Err(EncodeError::OutOfRange {
                    field: path.to_string(),
                    kind: k.to_string(),
                });
            }
            writer.write_bits(raw, k.width());
        }
        FieldKind::Float(fk) => {
            let real = as_f64(value).ok_or_else(mismatch)?;
            match fk {
                FloatKind::F32 => writer.write_bits(i128::from((real as f32).to_bits()), 4),
                FloatKind::F64 => writer.write_bits(i128::from(real.to_bits()), 8),
            }
        }
        FieldKind::Bool => {
            let Value::Bool(b) = value else {
                return Err(mismatch());
            };
            writer.buf.push(u8::from(*b));
        }
        FieldKind::Bytes { length } => {
            let Value::Bytes(bytes) = value else {
                return Err(mismatch());
            };
            if bytes.len() != *length {
                return Err(EncodeError::LengthMismatch {
                    field: path.to_string(),
                    expected: *length,
                    actual: bytes.len(),
                });
            }
            writer.buf.extend_from_slice(bytes);
        }
        FieldKind::FixedString { length } => {
            let Value::Text(text) = value else {
                return Err(mismatch());
            };
            if text.len() > *length {
                return Err(EncodeError::LengthMismatch {
                    field: path.to_string(),
                    expected: *length,
                    actual: text.len(),
                });
            }
            writer.buf.extend_from_slice(text.as_bytes());
            writer.buf.resize(writer.buf.len() + (length - text.len()), 0);
        }
        FieldKind::String { .. } => {
            let Value::Text(text) = value else {
                return Err(mismatch());
            };
            writer.buf.extend_from_slice(text.as_bytes());
        }
        FieldKind::Sequence { element, .. } => {
            let Value::Sequence(items) = value else {
                return Err(mismatch());
            };
            for (i, item) in items.iter().enumerate() {
                encode_value(element, item, writer, &format!("{path}[{i}]"))?;
            }
        }
        FieldKind::Record(schema) => {
            let Value::Record(nested) = value else {
                return Err(mismatch());
            };
            encode_record(schema, nested, writer, path)?;
        }
        FieldKind::Enum { base, values } => {
            let Value::Enum(name) = value else {
                return Err(mismatch());
            };
            let entry = values
                .iter()
                .find(|e| e.name == *name)
                .ok_or_else(|| EncodeError::UnknownEnumName {
                    field: path.to_string(),
                    name: name.clone(),
                })?;
            writer.write_bits(i128::from(entry.value), base.width());
        }
        FieldKind::Scaled { base, scale } => {
            let real = as_f64(value).ok_or_else(mismatch)?;
            let raw = scale.to_raw(real);
            // `max + 1` is a power of two and exact as f64; `max` itself
            // rounds up for 64-bit bases.
            if !raw.is_finite() || raw < base.min() as f64 || raw >= (base.max() + 1) as f64 {
                return Err(EncodeError::OutOfRange {
                    field: path.to_string(),
                    kind: kind.describe(),
                });
            }
            writer.write_bits(raw as i128, base.width());
        }
        FieldKind::Array { element, length } => {
            let Value::Sequence(items) = value else {
                return Err(mismatch());
            };
            if items.len() != *length {
                return Err(EncodeError::LengthMismatch {
                    field: path.to_string(),
                    expected: *length,
                    actual: items.len(),
                });
            }
            for (i, item) in items.iter().enumerate() {
                encode_value(element, item, writer, &format!("{path}[{i}]"))?;
            }
        }
        FieldKind::BitField { base, subfields } => {
            let Value::Record(parts) = value else {
                return Err(mismatch());
            };
            let raw = encode_bit_field(subfields, parts, path)?;
            writer.write_bits(i128::from(raw), base.width());
        }
        FieldKind::Variant { selector, options } => {
            let Value::Variant(name, inner) = value else {
                return Err(mismatch());
            };
            let index = options
                .iter()
                .position(|o| o.name == *name)
                .ok_or_else(|| EncodeError::UnknownVariant {
                    field: path.to_string(),
                    name: name.clone(),
                })?;
            writer.write_bits(index as i128, selector.width());
            encode_value(&options[index].kind, inner, writer, &child(path, name))?;
        }
    }
    Ok(())
}

fn encode_bit_field(
    subfields: &[SubField],
    parts: &MessageInstance,
    path: &str,
) -> Result<u64, EncodeError> {
    for (name, _) in parts.iter() {
        if !subfields.iter().any(|s| s.name == name) {
            return Err(EncodeError::UnexpectedField(child(path, name)));
        }
    }

    let mut raw = 0u64;
    for sub in subfields {
        let sub_path = child(path, &sub.name);
        let range = || format!("{}-bit field", sub.width());
        let value = parts
            .get(&sub.name)
            .ok_or_else(|| EncodeError::MissingField(sub_path.clone()))?;
        let bits = match value {
            Value::Enum(name) => {
                let entry = sub.values.iter().find(|e| e.name == *name).ok_or_else(|| {
                    EncodeError::UnknownEnumName {
                        field: sub_path.clone(),
                        name: name.clone(),
                    }
                })?;
                entry.value as u64
            }
            other => {
                let wide = other.as_i128().ok_or_else(|| EncodeError::TypeMismatch {
                    field: sub_path.clone(),
                    expected: range(),
                    found: other.type_name(),
                })?;
                if wide < 0 || wide > i128::from(sub.max()) {
                    return Err(EncodeError::OutOfRange {
                        field: sub_path,
                        kind: range(),
                    });
                }
                wide as u64
            }
        };
        raw |= bits << sub.from;
    }
    Ok(raw)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Unsigned(v) => Some(*v as f64),
        Value::Signed(v) => Some(*v as f64),
        _ => None,
    }
}
