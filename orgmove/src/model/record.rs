//! Record representation shared by sources, targets and engines

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field map backing a record
pub type FieldMap = serde_json::Map<String, Value>;

/// System identifier field
pub const ID_FIELD: &str = "Id";

/// Field that receives the error text of a failed operation
pub const ERROR_FIELD: &str = "Errors";

/// A single record: field name -> JSON value
///
/// Lookup paths such as `Account.Name` are stored either flat (as read from
/// CSV files) or nested (as returned by REST queries); [`Record::get`] reads
/// both shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: FieldMap,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing field map
    pub fn from_map(fields: FieldMap) -> Self {
        Record { fields }
    }

    /// Build a record from a JSON object, `None` for any other JSON shape
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Record { fields }),
            _ => None,
        }
    }

    /// Builder-style setter
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Get a field value, following dotted lookup paths into nested objects
    pub fn get(&self, field: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(field) {
            return Some(value);
        }
        let (head, rest) = field.split_once('.')?;
        let mut current = self.fields.get(head)?;
        for segment in rest.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Get a field as a non-empty string (scalars are stringified)
    pub fn get_str(&self, field: &str) -> Option<String> {
        self.get(field).and_then(value_to_string)
    }

    /// Whether the field is present (even if null)
    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Set a field value
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Remove a field, returning its previous value
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// System identifier, if the record has one
    pub fn id(&self) -> Option<String> {
        self.get_str(ID_FIELD)
    }

    /// Set the system identifier
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.fields.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// Error text recorded by a failed operation
    pub fn error(&self) -> Option<String> {
        self.get_str(ERROR_FIELD)
    }

    /// Record an error message on this record
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.fields
            .insert(ERROR_FIELD.to_string(), Value::String(message.into()));
    }

    /// Borrow the underlying field map
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Field names in insertion order
    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Consume into the underlying map
    pub fn into_map(self) -> FieldMap {
        self.fields
    }

    /// Merge every field of `other` into this record
    pub fn merge(&mut self, other: &Record) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Copy only the listed fields (missing fields are skipped)
    pub fn project(&self, fields: &[String]) -> Record {
        let mut projected = FieldMap::new();
        for field in fields {
            if let Some(value) = self.get(field) {
                projected.insert(field.clone(), value.clone());
            }
        }
        Record { fields: projected }
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<FieldMap> for Record {
    fn from(fields: FieldMap) -> Self {
        Record::from_map(fields)
    }
}

/// Stringify a scalar JSON value; null and empty strings yield `None`
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}
