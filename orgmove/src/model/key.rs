//! Business-key normalization and record hashing
//!
//! Records are matched across endpoints by a composite key built from the
//! external-Id field(s). When no identifier is available (Bulk v2 insert
//! results, no-op update detection) a hash over the non-volatile fields is
//! used instead. The hash is a heuristic: rows with identical values collide.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::record::{ID_FIELD, Record, value_to_string};

/// Separator between composite key components (plan syntax and key text)
pub const KEY_SEPARATOR: char = ';';

/// System-maintained columns never compared by value
pub const VOLATILE_FIELDS: &[&str] = &[
    "Id",
    "Errors",
    "attributes",
    "CreatedDate",
    "CreatedById",
    "LastModifiedDate",
    "LastModifiedById",
    "SystemModstamp",
    "LastActivityDate",
    "LastViewedDate",
    "LastReferencedDate",
    "IsDeleted",
];

/// Prefix of result columns added by the Bulk v2 API
pub const BULK_RESULT_PREFIX: &str = "sf__";

/// Split a plan-level external-Id declaration (`Name;Type`) into fields
pub fn split_external_id(declaration: &str) -> Vec<String> {
    declaration
        .split(KEY_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the normalized external key of a record
///
/// Each component is trimmed and lower-cased (identifiers only trimmed, they
/// are case-sensitive). Returns `None` when every component is empty, so
/// blank keys never match each other.
pub fn external_key(record: &Record, key_fields: &[String]) -> Option<String> {
    if key_fields.is_empty() {
        return None;
    }

    let mut any_value = false;
    let parts: Vec<String> = key_fields
        .iter()
        .map(|field| {
            let part = record
                .get_str(field)
                .map(|value| normalize_component(field, &value))
                .unwrap_or_default();
            any_value |= !part.is_empty();
            part
        })
        .collect();

    any_value.then(|| parts.join(&KEY_SEPARATOR.to_string()))
}

/// Normalize a raw key text (as it would appear in a lookup path column)
pub fn normalize_key_text(field: &str, raw: &str) -> String {
    normalize_component(field, raw)
}

fn normalize_component(field: &str, value: &str) -> String {
    let trimmed = value.trim();
    if field == ID_FIELD || field.ends_with(".Id") {
        trimmed.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Whether a column takes part in value comparison
pub fn is_comparable_field(name: &str, excluded: &[String]) -> bool {
    !name.starts_with(BULK_RESULT_PREFIX)
        && !VOLATILE_FIELDS.contains(&name)
        && !excluded.iter().any(|e| e.eq_ignore_ascii_case(name))
}

/// Hash a record over its comparable fields
///
/// Values are compared in their string form so CSV result rows (all text)
/// hash equal to the typed JSON records they came from; null and empty
/// strings are the same value.
pub fn record_hash(record: &Record, excluded: &[String]) -> u64 {
    let mut entries: Vec<(&str, String)> = record
        .fields()
        .iter()
        .filter(|(name, _)| is_comparable_field(name, excluded))
        .map(|(name, value)| (name.as_str(), value_to_string(value).unwrap_or_default()))
        .filter(|(_, value)| !value.is_empty())
        .collect();
    entries.sort();

    let mut hasher = DefaultHasher::new();
    for (name, value) in entries {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

/// Hash only the listed fields of a record
pub fn subset_hash(record: &Record, fields: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for field in fields {
        field.hash(&mut hasher);
        record.get_str(field).unwrap_or_default().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_external_id() {
        assert_eq!(
            split_external_id("DeveloperName; NamespacePrefix ;SobjectType"),
            vec!["DeveloperName", "NamespacePrefix", "SobjectType"]
        );
        assert!(split_external_id("").is_empty());
    }

    #[test]
    fn test_external_key_normalizes_case_and_whitespace() {
        let fields = vec!["Name".to_string()];
        let a = Record::new().with("Name", " Acme Corp ");
        let b = Record::new().with("Name", "ACME CORP");
        assert_eq!(external_key(&a, &fields), external_key(&b, &fields));
    }

    #[test]
    fn test_external_key_keeps_empty_components() {
        let fields = vec![
            "DeveloperName".to_string(),
            "NamespacePrefix".to_string(),
            "SobjectType".to_string(),
        ];
        let record = Record::new()
            .with("DeveloperName", "Partner")
            .with("NamespacePrefix", serde_json::Value::Null)
            .with("SobjectType", "Account");
        assert_eq!(
            external_key(&record, &fields).as_deref(),
            Some("partner;;account")
        );
    }

    #[test]
    fn test_blank_key_never_matches() {
        let fields = vec!["Name".to_string()];
        assert_eq!(external_key(&Record::new().with("Name", "  "), &fields), None);
        assert_eq!(external_key(&Record::new(), &fields), None);

        let composite = vec!["FirstName".to_string(), "LastName".to_string()];
        let blank = Record::new().with("FirstName", " ").with("LastName", "");
        assert_eq!(external_key(&blank, &composite), None);
    }

    #[test]
    fn test_id_key_is_case_sensitive() {
        let fields = vec!["Id".to_string()];
        let a = Record::new().with("Id", "001aB");
        let b = Record::new().with("Id", "001AB");
        assert_ne!(external_key(&a, &fields), external_key(&b, &fields));
    }

    #[test]
    fn test_record_hash_ignores_volatile_and_result_columns() {
        let typed = Record::from_json(json!({
            "Name": "Acme", "NumberOfEmployees": 10, "Id": "001", "Phone": null
        }))
        .unwrap();
        let from_csv = Record::from_json(json!({
            "sf__Id": "001X", "sf__Created": "true", "Name": "Acme",
            "NumberOfEmployees": "10", "Phone": ""
        }))
        .unwrap();
        assert_eq!(record_hash(&typed, &[]), record_hash(&from_csv, &[]));

        let other = Record::new().with("Name", "Other").with("NumberOfEmployees", 10);
        assert_ne!(record_hash(&typed, &[]), record_hash(&other, &[]));
    }
}
