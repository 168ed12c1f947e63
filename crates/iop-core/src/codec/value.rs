//! Decoded message contents, independent of both wire format and JSON.

/// One field value.
///
/// Integers keep their signedness so a `u64` above `i64::MAX` survives a
/// decode/encode cycle unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    /// Floats and scaled integers.
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    /// Enumeration, by name.
    Enum(String),
    Record(MessageInstance),
    Sequence(Vec<Value>),
    /// The selected option of a variant, by name.
    Variant(String, Box<Value>),
}

impl Value {
    /// Name of the variant, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unsigned(_) => "unsigned integer",
            Value::Signed(_) => "signed integer",
            Value::Float(_) => "number",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Enum(_) => "enum",
            Value::Record(_) => "record",
            Value::Sequence(_) => "sequence",
            Value::Variant(..) => "variant",
        }
    }

    /// The value as a wide integer, for range checks across both signednesses.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Unsigned(v) => Some(i128::from(*v)),
            Value::Signed(v) => Some(i128::from(*v)),
            _ => None,
        }
    }
}

/// Field name → value mapping for one message or record.
///
/// Fields are kept in insertion order (the decoder inserts them in wire
/// order), but equality ignores order: two instances are equal when they
/// hold the same set of fields with equal values.
#[derive(Debug, Clone, Default)]
pub struct MessageInstance {
    fields: Vec<(String, Value)>,
}

impl MessageInstance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets a field, replacing any previous value of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl PartialEq for MessageInstance {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(name, value)| other.get(name) == Some(value))
    }
}
