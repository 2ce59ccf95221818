//! Entity and field describe models

use serde::{Deserialize, Serialize};

/// Which endpoint a describe belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Source,
    Target,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Target => "target",
        }
    }
}

/// Field data types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldType {
    Id,
    String,
    Textarea,
    Boolean,
    Integer,
    Double,
    Currency,
    Date,
    DateTime,
    Picklist,
    Reference,
    Other(String),
}

impl FieldType {
    /// Parse the type name reported by the describe call
    pub fn from_api(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "id" => FieldType::Id,
            "string" | "email" | "phone" | "url" => FieldType::String,
            "textarea" => FieldType::Textarea,
            "boolean" => FieldType::Boolean,
            "int" | "long" => FieldType::Integer,
            "double" | "percent" => FieldType::Double,
            "currency" => FieldType::Currency,
            "date" => FieldType::Date,
            "datetime" => FieldType::DateTime,
            "picklist" | "multipicklist" => FieldType::Picklist,
            "reference" => FieldType::Reference,
            other => FieldType::Other(other.to_string()),
        }
    }
}

/// Field metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescribe {
    pub name: String,
    pub field_type: FieldType,
    pub creatable: bool,
    pub updateable: bool,
    pub is_lookup: bool,
    /// Entities this lookup can point at (several when polymorphic)
    #[serde(default)]
    pub referenced_entities: Vec<String>,
    /// Relationship name for lookup paths (e.g. "Account" for "AccountId")
    #[serde(default)]
    pub relationship_name: Option<String>,
    pub is_polymorphic: bool,
    #[serde(default)]
    pub is_external_id: bool,
    #[serde(default)]
    pub is_name_field: bool,
}

impl FieldDescribe {
    /// Plain writable field
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDescribe {
            name: name.into(),
            field_type,
            creatable: true,
            updateable: true,
            is_lookup: false,
            referenced_entities: Vec::new(),
            relationship_name: None,
            is_polymorphic: false,
            is_external_id: false,
            is_name_field: false,
        }
    }

    /// Lookup field to a single entity
    pub fn lookup(
        name: impl Into<String>,
        relationship: impl Into<String>,
        referenced: impl Into<String>,
    ) -> Self {
        FieldDescribe {
            is_lookup: true,
            referenced_entities: vec![referenced.into()],
            relationship_name: Some(relationship.into()),
            ..FieldDescribe::new(name, FieldType::Reference)
        }
    }

    /// Lookup field that can point at several entities
    pub fn polymorphic(
        name: impl Into<String>,
        relationship: impl Into<String>,
        referenced: &[&str],
    ) -> Self {
        FieldDescribe {
            is_lookup: true,
            referenced_entities: referenced.iter().map(|s| s.to_string()).collect(),
            relationship_name: Some(relationship.into()),
            is_polymorphic: true,
            ..FieldDescribe::new(name, FieldType::Reference)
        }
    }

    /// Builder: read-only system field
    pub fn read_only(mut self) -> Self {
        self.creatable = false;
        self.updateable = false;
        self
    }

    /// Builder: mark as the entity's name field
    pub fn name_field(mut self) -> Self {
        self.is_name_field = true;
        self
    }

    /// First referenced entity, for single-target lookups
    pub fn referenced_entity(&self) -> Option<&str> {
        self.referenced_entities.first().map(|s| s.as_str())
    }
}

/// Entity metadata with its fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescribe {
    pub name: String,
    pub creatable: bool,
    pub updateable: bool,
    pub deletable: bool,
    pub fields: Vec<FieldDescribe>,
}

impl EntityDescribe {
    /// Fully capable entity with the given fields
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescribe>) -> Self {
        EntityDescribe {
            name: name.into(),
            creatable: true,
            updateable: true,
            deletable: true,
            fields,
        }
    }

    /// Find a field by name (case-insensitive)
    pub fn field(&self, name: &str) -> Option<&FieldDescribe> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Whether the field exists
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// The entity's name field, if it has one
    pub fn name_field(&self) -> Option<&FieldDescribe> {
        self.fields
            .iter()
            .find(|f| f.is_name_field)
            .or_else(|| self.field("Name"))
    }

    /// All lookup fields
    pub fn lookups(&self) -> impl Iterator<Item = &FieldDescribe> {
        self.fields.iter().filter(|f| f.is_lookup)
    }

    /// Lookup field by relationship name (e.g. "Account" -> AccountId)
    pub fn lookup_by_relationship(&self, relationship: &str) -> Option<&FieldDescribe> {
        self.lookups().find(|f| {
            f.relationship_name
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(relationship))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> EntityDescribe {
        EntityDescribe::new(
            "Contact",
            vec![
                FieldDescribe::new("Id", FieldType::Id).read_only(),
                FieldDescribe::new("LastName", FieldType::String).name_field(),
                FieldDescribe::lookup("AccountId", "Account", "Account"),
                FieldDescribe::polymorphic("OwnerId", "Owner", &["User", "Group"]),
            ],
        )
    }

    #[test]
    fn test_field_lookup_is_case_insensitive() {
        let d = contact();
        assert!(d.field("accountid").is_some());
        assert!(d.field("Missing").is_none());
    }

    #[test]
    fn test_name_field_prefers_flag() {
        assert_eq!(contact().name_field().unwrap().name, "LastName");
    }

    #[test]
    fn test_lookups() {
        let d = contact();
        assert_eq!(d.lookups().count(), 2);
        let owner = d.lookup_by_relationship("owner").unwrap();
        assert!(owner.is_polymorphic);
        assert_eq!(owner.referenced_entities, vec!["User", "Group"]);
        assert_eq!(
            d.field("AccountId").unwrap().referenced_entity(),
            Some("Account")
        );
    }

    #[test]
    fn test_field_type_from_api() {
        assert_eq!(FieldType::from_api("reference"), FieldType::Reference);
        assert_eq!(FieldType::from_api("email"), FieldType::String);
        assert_eq!(
            FieldType::from_api("location"),
            FieldType::Other("location".to_string())
        );
    }
}
