//! Schema registry: loads schema artifacts and indexes the compiled schemas.
//!
//! # Artifact format
//!
//! ```json
//! {
//!   "byteOrder": "little",
//!   "records": [
//!     { "name": "Point", "fields": [ { "name": "x", "type": "i32" } ] }
//!   ],
//!   "messages": [
//!     { "id": "0x4b00", "name": "ReportIdentification", "fields": [
//!         { "name": "queryType", "type": "enum", "base": "u8",
//!           "values": [ { "name": "System", "value": 2 } ] },
//!         { "name": "nameLength", "type": "u8" },
//!         { "name": "identification", "type": "string", "countField": "nameLength" }
//!     ] }
//!   ]
//! }
//! ```
//!
//! `byteOrder` defaults to `"little"` (the JAUS wire order).  Every artifact
//! loaded into one registry must agree on it.
//!
//! # Load-time checks
//!
//! Everything the codec later relies on is verified here, once:
//!
//! - message ids and schema names are unique;
//! - `record` references resolve and do not form a cycle;
//! - a `countField` names a required integer declared earlier in the same schema;
//! - optional fields follow a presence vector wide enough to hold their bits;
//! - sequence and array elements are neither count-governed nor presence
//!   vectors, and occupy at least one byte;
//! - bit field ranges fit their unsigned base and do not overlap;
//! - variant options fit their selector and are uniquely named;
//! - enum values fit their base integer and have unique names and values.
//!
//! A registry that loaded successfully is never mutated again.  Share it as
//! `Arc<SchemaRegistry>`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::artifact::{ArtifactDef, IdDef, KindDef, SchemaDef, SubFieldDef};
use super::{
    ByteOrder, Enumerant, FieldDescriptor, FieldKind, FieldRole, FloatKind, IntKind, MessageId,
    Scale, Schema, SubField, VariantOption,
};

/// Errors raised while loading a schema artifact.  All of them are fatal.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("cannot read schema artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed schema artifact {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no schema artifacts (*.json) found in {0}")]
    Empty(PathBuf),

    #[error("duplicate {what} `{key}`")]
    Duplicate { what: &'static str, key: String },

    #[error("schema `{schema}`, field `{field}`: unknown record `{reference}`")]
    Unresolved {
        schema: String,
        field: String,
        reference: String,
    },

    #[error("record references form a cycle: {}", .0.join(" -> "))]
    Cyclic(Vec<String>),

    #[error("schema `{schema}`, field `{field}`: {reason}")]
    Invalid {
        schema: String,
        field: String,
        reason: String,
    },

    #[error("schema artifacts disagree on byte order ({first:?} vs {second:?})")]
    ByteOrderConflict { first: ByteOrder, second: ByteOrder },
}

/// Lookup failure for an identifier that has no schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no schema for message id {0:#06x}")]
    NotFound(MessageId),
}

/// Immutable index of compiled schemas.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    by_id: BTreeMap<MessageId, Arc<Schema>>,
    by_name: HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// Builds a registry from a single artifact document.
    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        let artifact = parse_artifact("<inline>", text)?;
        Self::build(vec![artifact])
    }

    /// Loads an artifact file, or every `*.json` file in a directory.
    ///
    /// Directory entries are read in file-name order so that error messages
    /// are reproducible.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let io_err = |source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        };

        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(io_err)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            if files.is_empty() {
                return Err(SchemaError::Empty(path.to_path_buf()));
            }
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut artifacts = Vec::with_capacity(files.len());
        for file in &files {
            let text = std::fs::read_to_string(file).map_err(|source| SchemaError::Io {
                path: file.clone(),
                source,
            })?;
            debug!("parsing schema artifact {}", file.display());
            artifacts.push(parse_artifact(&file.display().to_string(), &text)?);
        }

        let registry = Self::build(artifacts)?;
        info!(
            "loaded {} message schemas from {} artifact(s) under {}",
            registry.len(),
            files.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Returns the schema for a message id.
    pub fn lookup(&self, id: MessageId) -> Result<&Arc<Schema>, LookupError> {
        self.by_id.get(&id).ok_or(LookupError::NotFound(id))
    }

    /// Returns a message or record schema by name.
    pub fn lookup_by_name(&self, name: &str) -> Option<&Arc<Schema>> {
        self.by_name.get(name)
    }

    /// Number of message schemas (records without an id are not counted).
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// All registered message ids in ascending order.
    pub fn ids(&self) -> Vec<MessageId> {
        self.by_id.keys().copied().collect()
    }

    fn build(artifacts: Vec<ArtifactDef>) -> Result<Self, SchemaError> {
        let byte_order = merged_byte_order(&artifacts)?;

        let mut compiler = Compiler {
            byte_order,
            defs: HashMap::new(),
            compiled: HashMap::new(),
            stack: Vec::new(),
        };

        let mut by_id_names: BTreeMap<MessageId, &str> = BTreeMap::new();
        let mut order: Vec<&str> = Vec::new();

        for artifact in &artifacts {
            for def in &artifact.records {
                if def.id.is_some() {
                    return Err(invalid(&def.name, "id", "records cannot carry a message id"));
                }
                compiler.add(def, None)?;
                order.push(&def.name);
            }
            for def in &artifact.messages {
                let id = parse_id(def)?;
                if by_id_names.insert(id, &def.name).is_some() {
                    return Err(SchemaError::Duplicate {
                        what: "message id",
                        key: format!("{id:#06x}"),
                    });
                }
                compiler.add(def, Some(id))?;
                order.push(&def.name);
            }
        }

        let mut registry = SchemaRegistry::default();
        for name in order {
            let schema = compiler.compile(name)?;
            if let Some(id) = schema.id() {
                registry.by_id.insert(id, Arc::clone(&schema));
            }
            registry.by_name.insert(name.to_string(), schema);
        }
        Ok(registry)
    }
}

fn parse_artifact(origin: &str, text: &str) -> Result<ArtifactDef, SchemaError> {
    serde_json::from_str(text).map_err(|source| SchemaError::Parse {
        origin: origin.to_string(),
        source,
    })
}

fn merged_byte_order(artifacts: &[ArtifactDef]) -> Result<ByteOrder, SchemaError> {
    let mut declared: Option<ByteOrder> = None;
    for order in artifacts.iter().filter_map(|a| a.byte_order) {
        match declared {
            Some(first) if first != order => {
                return Err(SchemaError::ByteOrderConflict {
                    first,
                    second: order,
                })
            }
            _ => declared = Some(order),
        }
    }
    Ok(declared.unwrap_or_default())
}

fn parse_id(def: &SchemaDef) -> Result<MessageId, SchemaError> {
    let parsed = match &def.id {
        None => return Err(invalid(&def.name, "id", "messages require a message id")),
        Some(IdDef::Number(n)) => MessageId::try_from(*n).ok(),
        Some(IdDef::Text(text)) => {
            let digits = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .unwrap_or(text);
            MessageId::from_str_radix(digits, 16).ok()
        }
    };
    parsed.ok_or_else(|| invalid(&def.name, "id", "message id must be a 16-bit number"))
}

fn invalid(schema: &str, field: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::Invalid {
        schema: schema.to_string(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

// ── Compilation ───────────────────────────────────────────────────────────────

struct Compiler<'a> {
    byte_order: ByteOrder,
    defs: HashMap<&'a str, (&'a SchemaDef, Option<MessageId>)>,
    compiled: HashMap<String, Arc<Schema>>,
    /// Names currently being compiled, outermost first.
    stack: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn add(&mut self, def: &'a SchemaDef, id: Option<MessageId>) -> Result<(), SchemaError> {
        if self.defs.insert(&def.name, (def, id)).is_some() {
            return Err(SchemaError::Duplicate {
                what: "schema name",
                key: def.name.clone(),
            });
        }
        Ok(())
    }

    fn compile(&mut self, name: &str) -> Result<Arc<Schema>, SchemaError> {
        if let Some(schema) = self.compiled.get(name) {
            return Ok(Arc::clone(schema));
        }
        if let Some(pos) = self.stack.iter().position(|n| n == name) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(SchemaError::Cyclic(cycle));
        }
        let Some(&(def, id)) = self.defs.get(name) else {
            return Err(SchemaError::Unresolved {
                schema: self.stack.last().cloned().unwrap_or_default(),
                field: String::new(),
                reference: name.to_string(),
            });
        };

        self.stack.push(name.to_string());
        let fields = self.compile_fields(def)?;
        self.stack.pop();

        let schema = Arc::new(Schema::new(id, def.name.clone(), self.byte_order, fields));
        self.compiled.insert(name.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    fn compile_fields(&mut self, def: &'a SchemaDef) -> Result<Vec<FieldDescriptor>, SchemaError> {
        let schema = def.name.as_str();
        let mut fields: Vec<FieldDescriptor> = Vec::with_capacity(def.fields.len());
        let mut presence: Option<IntKind> = None;
        let mut optional_fields = 0usize;

        for field_def in &def.fields {
            let name = field_def.name.as_str();
            if fields.iter().any(|f| f.name == name) {
                return Err(invalid(schema, name, "duplicate field name"));
            }

            let kind = self.convert_kind(schema, name, &field_def.kind)?;

            if let Some(count_name) = kind.count_field() {
                let Some(count) = fields.iter_mut().find(|f| f.name == count_name) else {
                    return Err(invalid(
                        schema,
                        name,
                        format!("count field `{count_name}` must be declared before this field"),
                    ));
                };
                if !matches!(count.kind, FieldKind::Int(_)) {
                    return Err(invalid(
                        schema,
                        name,
                        format!("count field `{count_name}` must be a plain integer"),
                    ));
                }
                if count.optional {
                    return Err(invalid(
                        schema,
                        name,
                        format!("count field `{count_name}` cannot be optional"),
                    ));
                }
                count.role = FieldRole::Count;
            }

            let role = if let FieldKind::PresenceVector(base) = kind {
                if presence.is_some() {
                    return Err(invalid(schema, name, "a schema has at most one presence vector"));
                }
                if field_def.optional {
                    return Err(invalid(schema, name, "a presence vector cannot be optional"));
                }
                presence = Some(base);
                FieldRole::Presence
            } else {
                FieldRole::Value
            };

            if field_def.optional {
                let Some(base) = presence else {
                    return Err(invalid(
                        schema,
                        name,
                        "optional fields require a preceding presence vector",
                    ));
                };
                optional_fields += 1;
                if optional_fields > base.width() * 8 {
                    return Err(invalid(
                        schema,
                        name,
                        format!("presence vector ({base}) has no bit left for this field"),
                    ));
                }
            }

            fields.push(FieldDescriptor {
                name: name.to_string(),
                kind,
                optional: field_def.optional,
                role,
            });
        }
        Ok(fields)
    }

    fn convert_kind(
        &mut self,
        schema: &str,
        field: &str,
        def: &KindDef,
    ) -> Result<FieldKind, SchemaError> {
        if let Some(int) = def.as_int() {
            return Ok(FieldKind::Int(int));
        }
        let kind = match def {
            KindDef::F32 => FieldKind::Float(FloatKind::F32),
            KindDef::F64 => FieldKind::Float(FloatKind::F64),
            KindDef::Bool => FieldKind::Bool,
            KindDef::Bytes { length } => FieldKind::Bytes { length: *length },
            KindDef::FixedString { length } => FieldKind::FixedString { length: *length },
            KindDef::String { count_field } => FieldKind::String {
                count_field: count_field.clone(),
            },
            KindDef::Sequence {
                element,
                count_field,
            } => FieldKind::Sequence {
                element: Box::new(self.element_kind(schema, field, element)?),
                count_field: count_field.clone(),
            },
            KindDef::Array { element, length } => {
                if *length == 0 {
                    return Err(invalid(schema, field, "array length must be positive"));
                }
                FieldKind::Array {
                    element: Box::new(self.element_kind(schema, field, element)?),
                    length: *length,
                }
            }
            KindDef::Record { reference } => {
                if !self.defs.contains_key(reference.as_str()) {
                    return Err(SchemaError::Unresolved {
                        schema: schema.to_string(),
                        field: field.to_string(),
                        reference: reference.clone(),
                    });
                }
                FieldKind::Record(self.compile(reference)?)
            }
            KindDef::Enum { base, values } => {
                let mut enumerants: Vec<Enumerant> = Vec::with_capacity(values.len());
                for v in values {
                    if !base.contains(i128::from(v.value)) {
                        return Err(invalid(
                            schema,
                            field,
                            format!("enum value {} ({}) does not fit {base}", v.name, v.value),
                        ));
                    }
                    if enumerants.iter().any(|e| e.name == v.name || e.value == v.value) {
                        return Err(invalid(
                            schema,
                            field,
                            format!("enum entry {} = {} is not unique", v.name, v.value),
                        ));
                    }
                    enumerants.push(Enumerant {
                        name: v.name.clone(),
                        value: v.value,
                    });
                }
                FieldKind::Enum {
                    base: *base,
                    values: enumerants,
                }
            }
            KindDef::Scaled {
                base,
                scale_factor,
                bias,
            } => {
                if !scale_factor.is_finite() || *scale_factor == 0.0 || !bias.is_finite() {
                    return Err(invalid(
                        schema,
                        field,
                        "scaleFactor must be finite and non-zero, bias must be finite",
                    ));
                }
                FieldKind::Scaled {
                    base: *base,
                    scale: Scale {
                        factor: *scale_factor,
                        bias: *bias,
                    },
                }
            }
            KindDef::PresenceVector { base } => FieldKind::PresenceVector(*base),
            KindDef::BitField { base, subfields } => FieldKind::BitField {
                base: *base,
                subfields: compile_subfields(schema, field, *base, subfields)?,
            },
            KindDef::Variant { selector, options } => {
                if options.is_empty() {
                    return Err(invalid(schema, field, "a variant needs at least one option"));
                }
                if !selector.contains(options.len() as i128 - 1) {
                    return Err(invalid(
                        schema,
                        field,
                        format!("{} options do not fit selector {selector}", options.len()),
                    ));
                }
                let mut compiled: Vec<VariantOption> = Vec::with_capacity(options.len());
                for option in options {
                    if compiled.iter().any(|o| o.name == option.name) {
                        return Err(invalid(
                            schema,
                            field,
                            format!("duplicate variant option `{}`", option.name),
                        ));
                    }
                    if option.kind.is_record_level() {
                        return Err(invalid(
                            schema,
                            field,
                            "variant options cannot be strings, sequences or presence vectors",
                        ));
                    }
                    compiled.push(VariantOption {
                        name: option.name.clone(),
                        kind: self.convert_kind(schema, field, &option.kind)?,
                    });
                }
                FieldKind::Variant {
                    selector: *selector,
                    options: compiled,
                }
            }
            // Plain integers were handled above.
            _ => return Err(invalid(schema, field, "unsupported field type")),
        };
        Ok(kind)
    }

    /// Element of a sequence or array.  Elements carry no count of their
    /// own and must occupy at least one byte, so a count read off the wire
    /// is always bounded by the bytes that follow it.
    fn element_kind(
        &mut self,
        schema: &str,
        field: &str,
        def: &KindDef,
    ) -> Result<FieldKind, SchemaError> {
        if def.is_record_level() {
            return Err(invalid(
                schema,
                field,
                "sequence elements cannot be strings, sequences or presence vectors",
            ));
        }
        let element = self.convert_kind(schema, field, def)?;
        if element.min_wire_size() == 0 {
            return Err(invalid(
                schema,
                field,
                format!("element {} has no bytes on the wire", element.describe()),
            ));
        }
        Ok(element)
    }
}

fn compile_subfields(
    schema: &str,
    field: &str,
    base: IntKind,
    defs: &[SubFieldDef],
) -> Result<Vec<SubField>, SchemaError> {
    if base.is_signed() {
        return Err(invalid(schema, field, "bit field base must be unsigned"));
    }
    if defs.is_empty() {
        return Err(invalid(schema, field, "a bit field needs at least one sub-field"));
    }
    let bits = base.width() as u32 * 8;
    let mut used = 0u64;
    let mut subfields: Vec<SubField> = Vec::with_capacity(defs.len());

    for def in defs {
        if def.from > def.to || def.to >= bits {
            return Err(invalid(
                schema,
                field,
                format!("sub-field `{}`: bits {}..={} outside {base}", def.name, def.from, def.to),
            ));
        }
        if subfields.iter().any(|s| s.name == def.name) {
            return Err(invalid(
                schema,
                field,
                format!("duplicate sub-field `{}`", def.name),
            ));
        }
        let mut sub = SubField {
            name: def.name.clone(),
            from: def.from,
            to: def.to,
            values: Vec::with_capacity(def.values.len()),
        };
        if used & sub.mask() != 0 {
            return Err(invalid(
                schema,
                field,
                format!("sub-field `{}` overlaps another sub-field", def.name),
            ));
        }
        used |= sub.mask();

        for v in &def.values {
            let fits = u64::try_from(v.value).is_ok_and(|value| value <= sub.max());
            if !fits || sub.values.iter().any(|e| e.name == v.name || e.value == v.value) {
                return Err(invalid(
                    schema,
                    field,
                    format!("sub-field `{}`: bad enum entry {} = {}", def.name, v.name, v.value),
                ));
            }
            sub.values.push(Enumerant {
                name: v.name.clone(),
                value: v.value,
            });
        }
        subfields.push(sub);
    }
    Ok(subfields)
}
