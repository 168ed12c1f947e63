//! Schema model: the compiled, validated description of every message type.
//!
//! A [`Schema`] is what the codec walks.  It is produced once by the
//! [`SchemaRegistry`] from a schema artifact and never mutated afterwards, so
//! it can be shared between any number of concurrent translations behind an
//! `Arc` without locking.
//!
//! # Field kinds
//!
//! The set of field kinds is closed ([`FieldKind`]).  Every component that
//! interprets a field (binary codec, JSON mapper, registry validation) matches
//! on it exhaustively, so adding a kind is a compile error everywhere it still
//! needs handling.
//!
//! Nested records are resolved at load time and held as `Arc<Schema>`, which
//! means neither the codec nor the mapper ever consults the registry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod artifact;
pub mod registry;

pub use registry::{LookupError, SchemaError, SchemaRegistry};

/// Numeric JAUS message identifier (the first two payload bytes on the wire).
pub type MessageId = u16;

// ── Primitive descriptors ─────────────────────────────────────────────────────

/// Byte order used for every multi-byte value in a message body.
///
/// JAUS itself is little-endian; the artifact may declare `"big"` for
/// peers that deviate.  The order is artifact-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Fixed-width integer kinds.
///
/// The JSIDL spellings emitted by the schema generator are accepted as
/// aliases so artifacts can be used without a translation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntKind {
    #[serde(alias = "unsigned byte")]
    U8,
    #[serde(alias = "unsigned short integer")]
    U16,
    #[serde(alias = "unsigned integer")]
    U32,
    #[serde(alias = "unsigned long integer")]
    U64,
    #[serde(alias = "byte")]
    I8,
    #[serde(alias = "short integer")]
    I16,
    #[serde(alias = "integer")]
    I32,
    #[serde(alias = "long integer")]
    I64,
}

impl IntKind {
    /// Width on the wire in bytes.
    pub fn width(self) -> usize {
        match self {
            IntKind::U8 | IntKind::I8 => 1,
            IntKind::U16 | IntKind::I16 => 2,
            IntKind::U32 | IntKind::I32 => 4,
            IntKind::U64 | IntKind::I64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, IntKind::I8 | IntKind::I16 | IntKind::I32 | IntKind::I64)
    }

    /// Smallest representable value.
    pub fn min(self) -> i128 {
        if self.is_signed() {
            -(1i128 << (self.width() * 8 - 1))
        } else {
            0
        }
    }

    /// Largest representable value.
    pub fn max(self) -> i128 {
        if self.is_signed() {
            (1i128 << (self.width() * 8 - 1)) - 1
        } else {
            (1i128 << (self.width() * 8)) - 1
        }
    }

    /// Returns `true` if `value` fits this kind.
    pub fn contains(self, value: i128) -> bool {
        value >= self.min() && value <= self.max()
    }
}

impl fmt::Display for IntKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntKind::U8 => "u8",
            IntKind::U16 => "u16",
            IntKind::U32 => "u32",
            IntKind::U64 => "u64",
            IntKind::I8 => "i8",
            IntKind::I16 => "i16",
            IntKind::I32 => "i32",
            IntKind::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// IEEE-754 float kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatKind {
    F32,
    F64,
}

impl FloatKind {
    pub fn width(self) -> usize {
        match self {
            FloatKind::F32 => 4,
            FloatKind::F64 => 8,
        }
    }
}

/// One named value of an enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerant {
    pub name: String,
    pub value: i64,
}

/// Linear scaling applied to an integer on the wire (`real = raw * factor + bias`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub factor: f64,
    pub bias: f64,
}

impl Scale {
    pub fn to_real(self, raw: i128) -> f64 {
        raw as f64 * self.factor + self.bias
    }

    pub fn to_raw(self, real: f64) -> f64 {
        ((real - self.bias) / self.factor).round()
    }
}

/// A named bit range `from..=to` inside a bit field (bit 0 is the least
/// significant bit of the base integer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubField {
    pub name: String,
    pub from: u32,
    pub to: u32,
    /// Named values; empty for a plain unsigned sub-field.
    pub values: Vec<Enumerant>,
}

impl SubField {
    pub fn width(&self) -> u32 {
        self.to - self.from + 1
    }

    /// Largest value the range can hold.
    pub fn max(&self) -> u64 {
        if self.width() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width()) - 1
        }
    }

    /// Bits of the base integer covered by this range.
    pub fn mask(&self) -> u64 {
        self.max() << self.from
    }

    pub fn extract(&self, raw: u64) -> u64 {
        (raw >> self.from) & self.max()
    }
}

/// One alternative of a variant.  Its position is the selector value.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantOption {
    pub name: String,
    pub kind: FieldKind,
}

// ── Field kinds ───────────────────────────────────────────────────────────────

/// The closed set of field kinds a schema can use.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Int(IntKind),
    Float(FloatKind),
    /// One byte, `0` or `1`.
    Bool,
    /// Fixed-length byte array.
    Bytes { length: usize },
    /// Fixed-length UTF-8 string, NUL-padded on the wire.
    FixedString { length: usize },
    /// UTF-8 string whose byte length is carried by `count_field`.
    String { count_field: String },
    /// Sequence of `element` whose length is carried by `count_field`.
    Sequence {
        element: Box<FieldKind>,
        count_field: String,
    },
    /// Nested record or message, resolved at load time.
    Record(Arc<Schema>),
    Enum {
        base: IntKind,
        values: Vec<Enumerant>,
    },
    Scaled { base: IntKind, scale: Scale },
    /// Bit mask announcing which optional fields follow.
    PresenceVector(IntKind),
    /// Unsigned integer split into named bit ranges.
    BitField {
        base: IntKind,
        subfields: Vec<SubField>,
    },
    /// Selector integer followed by the option it selects.
    Variant {
        selector: IntKind,
        options: Vec<VariantOption>,
    },
    /// Exactly `length` values of `element`; no count on the wire.
    Array {
        element: Box<FieldKind>,
        length: usize,
    },
}

impl FieldKind {
    /// Name of the count field governing this kind, if any.
    pub fn count_field(&self) -> Option<&str> {
        match self {
            FieldKind::String { count_field } | FieldKind::Sequence { count_field, .. } => {
                Some(count_field)
            }
            _ => None,
        }
    }

    /// The integer carried on the wire for integer-backed kinds.
    pub fn integer_base(&self) -> Option<IntKind> {
        match self {
            FieldKind::Int(k)
            | FieldKind::Enum { base: k, .. }
            | FieldKind::Scaled { base: k, .. }
            | FieldKind::PresenceVector(k) => Some(*k),
            _ => None,
        }
    }

    /// Lower bound on the encoded size of one value of this kind.
    ///
    /// Used while decoding to refuse a count that could not possibly fit in
    /// the remaining bytes before allocating anything for it.
    pub fn min_wire_size(&self) -> usize {
        match self {
            FieldKind::Int(k)
            | FieldKind::Enum { base: k, .. }
            | FieldKind::Scaled { base: k, .. }
            | FieldKind::PresenceVector(k) => k.width(),
            FieldKind::Float(k) => k.width(),
            FieldKind::Bool => 1,
            FieldKind::Bytes { length } | FieldKind::FixedString { length } => *length,
            FieldKind::String { .. } | FieldKind::Sequence { .. } => 0,
            FieldKind::Record(schema) => schema.min_wire_size(),
            FieldKind::BitField { base, .. } => base.width(),
            FieldKind::Variant { selector, options } => {
                selector.width()
                    + options
                        .iter()
                        .map(|o| o.kind.min_wire_size())
                        .min()
                        .unwrap_or(0)
            }
            FieldKind::Array { element, length } => length.saturating_mul(element.min_wire_size()),
        }
    }

    /// Short human-readable name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            FieldKind::Int(k) => k.to_string(),
            FieldKind::Float(FloatKind::F32) => "f32".to_string(),
            FieldKind::Float(FloatKind::F64) => "f64".to_string(),
            FieldKind::Bool => "bool".to_string(),
            FieldKind::Bytes { length } => format!("bytes[{length}]"),
            FieldKind::FixedString { length } => format!("string[{length}]"),
            FieldKind::String { .. } => "string".to_string(),
            FieldKind::Sequence { element, .. } => format!("sequence<{}>", element.describe()),
            FieldKind::Record(schema) => format!("record {}", schema.name()),
            FieldKind::Enum { base, .. } => format!("enum<{base}>"),
            FieldKind::Scaled { base, .. } => format!("scaled<{base}>"),
            FieldKind::PresenceVector(k) => format!("presence vector<{k}>"),
            FieldKind::BitField { base, .. } => format!("bit field<{base}>"),
            FieldKind::Variant { selector, .. } => format!("variant<{selector}>"),
            FieldKind::Array { element, length } => format!("array<{}>[{length}]", element.describe()),
        }
    }
}

/// What a field contributes to a message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Carries a value supplied by (and reported to) the client.
    Value,
    /// Integer derived from the length of the fields that reference it.
    Count,
    /// Bit mask derived from which optional fields are present.
    Presence,
}

/// One field of a schema, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub optional: bool,
    pub role: FieldRole,
}

impl FieldDescriptor {
    /// `true` for count and presence fields, which are never part of an instance.
    pub fn is_derived(&self) -> bool {
        self.role != FieldRole::Value
    }
}

// ── Schema ────────────────────────────────────────────────────────────────────

/// Compiled layout of one message type or record.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    id: Option<MessageId>,
    name: String,
    byte_order: ByteOrder,
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    pub(crate) fn new(
        id: Option<MessageId>,
        name: String,
        byte_order: ByteOrder,
        fields: Vec<FieldDescriptor>,
    ) -> Self {
        Self {
            id,
            name,
            byte_order,
            fields,
        }
    }

    /// Message identifier; `None` for records that are only used nested.
    pub fn id(&self) -> Option<MessageId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Field descriptors in wire order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Lower bound on the encoded size of an instance of this schema.
    pub fn min_wire_size(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| !f.optional)
            .map(|f| f.kind.min_wire_size())
            .sum()
    }
}
