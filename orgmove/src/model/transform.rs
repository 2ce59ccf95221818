//! Value transform definitions applied to source records
//!
//! Transforms are a closed set resolved at Setup; there is no embedded
//! expression language.

use serde::{Deserialize, Serialize};

/// A transform that writes one field of a source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueTransform {
    /// Copy a field of the same record
    FieldCopy { from: String, to: String },
    /// Copy a field from the parent record referenced by a lookup
    LookupCopy {
        /// Lookup field on this record (e.g. "AccountId")
        lookup: String,
        /// Entity the lookup references
        entity: String,
        /// Field to read on the parent record
        field: String,
        /// Field to write on this record
        to: String,
    },
    /// Write a constant value
    Constant {
        field: String,
        value: serde_json::Value,
    },
    /// Compute a value with a named built-in function
    Function {
        field: String,
        function: NamedFunction,
    },
}

/// Built-in transform functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum NamedFunction {
    /// Upper-case the current value
    Upper,
    /// Lower-case the current value
    Lower,
    /// Trim surrounding whitespace
    Trim,
    /// A fresh UUID
    NewGuid,
    /// Current UTC timestamp (RFC 3339)
    Now,
    /// Join other fields with a separator, skipping empty ones
    Concat {
        fields: Vec<String>,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

fn default_separator() -> String {
    " ".to_string()
}

impl ValueTransform {
    /// Field written by this transform
    pub fn target_field(&self) -> &str {
        match self {
            ValueTransform::FieldCopy { to, .. } => to,
            ValueTransform::LookupCopy { to, .. } => to,
            ValueTransform::Constant { field, .. } => field,
            ValueTransform::Function { field, .. } => field,
        }
    }

    /// Fields read from the record itself
    pub fn source_fields(&self) -> Vec<&str> {
        match self {
            ValueTransform::FieldCopy { from, .. } => vec![from.as_str()],
            ValueTransform::LookupCopy { lookup, .. } => vec![lookup.as_str()],
            ValueTransform::Constant { .. } => vec![],
            ValueTransform::Function { field, function } => match function {
                NamedFunction::Concat { fields, .. } => fields.iter().map(|f| f.as_str()).collect(),
                NamedFunction::Upper | NamedFunction::Lower | NamedFunction::Trim => {
                    vec![field.as_str()]
                }
                NamedFunction::NewGuid | NamedFunction::Now => vec![],
            },
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            ValueTransform::FieldCopy { from, to } => format!("{} = copy({})", to, from),
            ValueTransform::LookupCopy {
                lookup,
                entity,
                field,
                to,
            } => format!("{} = {}({}).{}", to, entity, lookup, field),
            ValueTransform::Constant { field, value } => format!("{} = {}", field, value),
            ValueTransform::Function { field, function } => {
                format!("{} = {:?}", field, function)
            }
        }
    }
}
