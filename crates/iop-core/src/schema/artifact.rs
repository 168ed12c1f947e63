//! Serde shapes of the schema artifact as written by the generator.
//!
//! These types only describe the JSON document.  Nothing here is validated;
//! [`super::registry`] turns them into [`super::Schema`] values and rejects
//! anything inconsistent.

use serde::Deserialize;

use super::{ByteOrder, IntKind};

/// One artifact file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ArtifactDef {
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    #[serde(default)]
    pub records: Vec<SchemaDef>,
    #[serde(default)]
    pub messages: Vec<SchemaDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SchemaDef {
    #[serde(default)]
    pub id: Option<IdDef>,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

/// Message ids appear either as numbers or as hex strings (`"4b00"`, `"0x4B00"`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum IdDef {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
pub(crate) struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(flatten)]
    pub kind: KindDef,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum KindDef {
    #[serde(rename = "u8", alias = "unsigned byte")]
    U8,
    #[serde(rename = "u16", alias = "unsigned short integer")]
    U16,
    #[serde(rename = "u32", alias = "unsigned integer")]
    U32,
    #[serde(rename = "u64", alias = "unsigned long integer")]
    U64,
    #[serde(rename = "i8", alias = "byte")]
    I8,
    #[serde(rename = "i16", alias = "short integer")]
    I16,
    #[serde(rename = "i32", alias = "integer")]
    I32,
    #[serde(rename = "i64", alias = "long integer")]
    I64,
    #[serde(rename = "f32", alias = "float")]
    F32,
    #[serde(rename = "f64", alias = "long float")]
    F64,
    #[serde(rename = "bool", alias = "boolean")]
    Bool,
    #[serde(rename = "bytes")]
    Bytes { length: usize },
    #[serde(rename = "fixedString")]
    FixedString { length: usize },
    #[serde(rename = "string")]
    String {
        #[serde(rename = "countField")]
        count_field: String,
    },
    #[serde(rename = "sequence")]
    Sequence {
        element: Box<KindDef>,
        #[serde(rename = "countField")]
        count_field: String,
    },
    #[serde(rename = "record")]
    Record {
        #[serde(rename = "ref")]
        reference: String,
    },
    #[serde(rename = "enum")]
    Enum {
        base: IntKind,
        values: Vec<EnumerantDef>,
    },
    #[serde(rename = "scaled")]
    Scaled {
        base: IntKind,
        #[serde(rename = "scaleFactor")]
        scale_factor: f64,
        #[serde(default)]
        bias: f64,
    },
    #[serde(rename = "presenceVector")]
    PresenceVector { base: IntKind },
    #[serde(rename = "bitField")]
    BitField {
        base: IntKind,
        subfields: Vec<SubFieldDef>,
    },
    #[serde(rename = "variant")]
    Variant {
        selector: IntKind,
        options: Vec<OptionDef>,
    },
    #[serde(rename = "array")]
    Array { element: Box<KindDef>, length: usize },
}

impl KindDef {
    /// The integer kind for the eight plain integer variants.
    pub fn as_int(&self) -> Option<IntKind> {
        let kind = match self {
            KindDef::U8 => IntKind::U8,
            KindDef::U16 => IntKind::U16,
            KindDef::U32 => IntKind::U32,
            KindDef::U64 => IntKind::U64,
            KindDef::I8 => IntKind::I8,
            KindDef::I16 => IntKind::I16,
            KindDef::I32 => IntKind::I32,
            KindDef::I64 => IntKind::I64,
            _ => return None,
        };
        Some(kind)
    }

    /// `true` for kinds that only make sense directly inside a record: the
    /// count-governed kinds and presence vectors.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            KindDef::String { .. } | KindDef::Sequence { .. } | KindDef::PresenceVector { .. }
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EnumerantDef {
    pub name: String,
    pub value: i64,
}

/// `{ "name": "mode", "from": 2, "to": 4 }`, optionally with enum `values`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SubFieldDef {
    pub name: String,
    pub from: u32,
    pub to: u32,
    #[serde(default)]
    pub values: Vec<EnumerantDef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OptionDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: KindDef,
}
