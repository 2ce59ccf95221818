//! Entity descriptors: the static description of one migratable entity

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::operation::{ApiMode, CrudOperation};
use super::query::QuerySpec;
use super::transform::ValueTransform;

/// A lookup field resolved from metadata during Setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupField {
    /// Field holding the parent identifier (e.g. "AccountId")
    pub field: String,
    /// Relationship name used in lookup paths (e.g. "Account")
    pub relationship: String,
    /// Entities the lookup may reference (more than one when polymorphic)
    pub referenced_entities: Vec<String>,
    pub is_polymorphic: bool,
}

impl LookupField {
    /// Single-target lookup
    pub fn new(
        field: impl Into<String>,
        relationship: impl Into<String>,
        referenced: impl Into<String>,
    ) -> Self {
        LookupField {
            field: field.into(),
            relationship: relationship.into(),
            referenced_entities: vec![referenced.into()],
            is_polymorphic: false,
        }
    }

    /// Path column carrying the parent's business key (e.g. "Account.Name")
    pub fn key_path(&self, parent_key_field: &str) -> String {
        format!("{}.{}", self.relationship, parent_key_field)
    }

    /// Whether the lookup points back at its own entity
    pub fn is_self_reference(&self, entity: &str) -> bool {
        self.referenced_entities.iter().any(|e| e == entity)
    }
}

/// Plan-declared polymorphic lookup: the field and the targets to follow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicLookup {
    pub field: String,
    /// Empty means "every target the metadata reports"
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Rename of the entity and/or fields on the target side
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Target entity name when it differs from the source
    #[serde(default)]
    pub target_entity: Option<String>,
    /// Source field -> target field
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl FieldMapping {
    /// Target name for a source field (unchanged when not mapped)
    pub fn target_field<'a>(&'a self, source_field: &'a str) -> &'a str {
        self.fields
            .get(source_field)
            .map(|s| s.as_str())
            .unwrap_or(source_field)
    }

    /// Source name for a target field (unchanged when not mapped)
    pub fn source_field<'a>(&'a self, target_field: &'a str) -> &'a str {
        self.fields
            .iter()
            .find(|(_, t)| t.as_str() == target_field)
            .map(|(s, _)| s.as_str())
            .unwrap_or(target_field)
    }
}

/// Static description of one migratable entity
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub name: String,
    pub query: QuerySpec,
    pub operation: CrudOperation,
    /// External-Id field(s); composite keys have several components
    pub external_id: Vec<String>,
    /// Resolved from metadata at Setup
    pub lookup_fields: Vec<LookupField>,
    pub polymorphic_lookups: Vec<PolymorphicLookup>,
    pub field_mapping: Option<FieldMapping>,
    pub transforms: Vec<ValueTransform>,
    /// Fields never written to the target
    pub excluded_fields: Vec<String>,
    /// Delete old target data (per query) before the main pass
    pub delete_old_data: bool,
    pub api_mode: ApiMode,
    /// Placeholder synthesized for an undeclared lookup target
    pub is_auto_added: bool,
}

impl EntityDescriptor {
    /// Descriptor with defaults for everything but name, query and operation
    pub fn new(query: QuerySpec, operation: CrudOperation) -> Self {
        EntityDescriptor {
            name: query.entity.clone(),
            query,
            operation,
            external_id: Vec::new(),
            lookup_fields: Vec::new(),
            polymorphic_lookups: Vec::new(),
            field_mapping: None,
            transforms: Vec::new(),
            excluded_fields: Vec::new(),
            delete_old_data: false,
            api_mode: ApiMode::Auto,
            is_auto_added: false,
        }
    }

    /// Read-only placeholder for an entity referenced but not declared
    pub fn placeholder(name: impl Into<String>, external_id: Vec<String>) -> Self {
        let name = name.into();
        let mut query = QuerySpec::select(name.clone(), &["Id"]);
        for field in &external_id {
            query.add_field(field.clone());
        }
        let mut descriptor = EntityDescriptor::new(query, CrudOperation::Readonly);
        descriptor.external_id = external_id;
        descriptor.is_auto_added = true;
        descriptor
    }

    /// Builder-style external Id setter
    pub fn with_external_id(mut self, fields: &[&str]) -> Self {
        self.external_id = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Entity name on the target side
    pub fn target_entity(&self) -> &str {
        self.field_mapping
            .as_ref()
            .and_then(|m| m.target_entity.as_deref())
            .unwrap_or(&self.name)
    }

    /// Target name of a source field
    pub fn target_field<'a>(&'a self, source_field: &'a str) -> &'a str {
        match &self.field_mapping {
            Some(mapping) => mapping.target_field(source_field),
            None => source_field,
        }
    }

    /// External-Id fields translated to target names
    pub fn target_external_id(&self) -> Vec<String> {
        self.external_id
            .iter()
            .map(|f| self.target_field(f).to_string())
            .collect()
    }

    /// Lookup declared on a field, if any
    pub fn lookup(&self, field: &str) -> Option<&LookupField> {
        self.lookup_fields
            .iter()
            .find(|l| l.field.eq_ignore_ascii_case(field))
    }

    /// Whether a field is excluded from writes
    pub fn is_excluded(&self, field: &str) -> bool {
        self.excluded_fields
            .iter()
            .any(|f| f.eq_ignore_ascii_case(field))
    }
}
