//! Value transform application

use chrono::Utc;
use log::debug;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::model::{NamedFunction, Record, RecordSet, ValueTransform};

/// Compute the value a transform writes for one record
///
/// `parent_records` finds the source records of another entity, for
/// `LookupCopy`.
pub fn apply_transform<'a, P>(
    entity: &str,
    transform: &ValueTransform,
    record: &Record,
    parent_records: &P,
) -> Result<Value>
where
    P: Fn(&str) -> Option<&'a RecordSet>,
{
    match transform {
        ValueTransform::FieldCopy { from, .. } => {
            Ok(record.get(from).cloned().unwrap_or(Value::Null))
        }

        ValueTransform::LookupCopy {
            lookup,
            entity: parent_entity,
            field,
            to,
        } => {
            let parents = parent_records(parent_entity).ok_or_else(|| MigrationError::Transform {
                entity: entity.to_string(),
                field: to.clone(),
                message: format!("{} is not part of this object-set", parent_entity),
            })?;
            Ok(record
                .get_str(lookup)
                .and_then(|id| parents.index_of_id(&id))
                .and_then(|idx| parents.get(idx))
                .and_then(|parent| parent.get(field).cloned())
                .unwrap_or(Value::Null))
        }

        ValueTransform::Constant { value, .. } => Ok(value.clone()),

        ValueTransform::Function { field, function } => {
            Ok(apply_function(function, record.get(field)).unwrap_or(Value::Null))
        }
    }
}

fn apply_function(function: &NamedFunction, current: Option<&Value>) -> Option<Value> {
    let text = || current.and_then(|v| v.as_str());
    match function {
        NamedFunction::Upper => text().map(|s| Value::String(s.to_uppercase())),
        NamedFunction::Lower => text().map(|s| Value::String(s.to_lowercase())),
        NamedFunction::Trim => text().map(|s| Value::String(s.trim().to_string())),
        NamedFunction::NewGuid => Some(Value::String(Uuid::new_v4().to_string())),
        NamedFunction::Now => Some(Value::String(Utc::now().to_rfc3339())),
        // Concat reads its own field list; handled by the caller
        NamedFunction::Concat { .. } => None,
    }
}

fn concat(record: &Record, fields: &[String], separator: &str) -> Value {
    let parts: Vec<String> = fields.iter().filter_map(|f| record.get_str(f)).collect();
    if parts.is_empty() {
        Value::Null
    } else {
        Value::String(parts.join(separator))
    }
}

/// Apply every transform, in declaration order, to every live record
///
/// Later transforms see the values written by earlier ones.
pub fn apply_transforms<'a, P>(
    entity: &str,
    transforms: &[ValueTransform],
    records: &mut RecordSet,
    parent_records: &P,
) -> Result<usize>
where
    P: Fn(&str) -> Option<&'a RecordSet>,
{
    if transforms.is_empty() {
        return Ok(0);
    }

    let positions: Vec<usize> = records.iter().map(|(idx, _)| idx).collect();
    for transform in transforms {
        debug!("{}: applying transform {}", entity, transform.describe());
        for &idx in &positions {
            let Some(record) = records.get(idx) else {
                continue;
            };
            let value = match transform {
                ValueTransform::Function {
                    function: NamedFunction::Concat { fields, separator },
                    ..
                } => concat(record, fields, separator),
                _ => apply_transform(entity, transform, record, parent_records)?,
            };
            if let Some(record) = records.get_mut(idx) {
                record.set(transform.target_field(), value);
            }
        }
    }
    Ok(positions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_parents(_: &str) -> Option<&'static RecordSet> {
        None
    }

    fn contacts() -> RecordSet {
        RecordSet::from_records(
            vec![
                Record::new()
                    .with("Id", "003A")
                    .with("FirstName", "  Ada ")
                    .with("LastName", "Lovelace")
                    .with("AccountId", "001A"),
                Record::new()
                    .with("Id", "003B")
                    .with("FirstName", Value::Null)
                    .with("LastName", "Hopper")
                    .with("AccountId", "001X"),
            ],
            vec!["LastName".to_string()],
        )
    }

    #[test]
    fn test_field_copy_and_constant() {
        let mut records = contacts();
        let transforms = vec![
            ValueTransform::FieldCopy {
                from: "LastName".to_string(),
                to: "Legacy_Name__c".to_string(),
            },
            ValueTransform::Constant {
                field: "LeadSource".to_string(),
                value: json!("Migration"),
            },
        ];
        let applied = apply_transforms("Contact", &transforms, &mut records, &no_parents).unwrap();
        assert_eq!(applied, 2);
        let first = records.get(0).unwrap();
        assert_eq!(first.get_str("Legacy_Name__c").as_deref(), Some("Lovelace"));
        assert_eq!(first.get_str("LeadSource").as_deref(), Some("Migration"));
    }

    #[test]
    fn test_functions_chain_in_order() {
        let mut records = contacts();
        let transforms = vec![
            ValueTransform::Function {
                field: "FirstName".to_string(),
                function: NamedFunction::Trim,
            },
            ValueTransform::Function {
                field: "FirstName".to_string(),
                function: NamedFunction::Upper,
            },
            ValueTransform::Function {
                field: "Description".to_string(),
                function: NamedFunction::Concat {
                    fields: vec!["FirstName".to_string(), "LastName".to_string()],
                    separator: " ".to_string(),
                },
            },
            ValueTransform::Function {
                field: "Migration_Key__c".to_string(),
                function: NamedFunction::NewGuid,
            },
        ];
        apply_transforms("Contact", &transforms, &mut records, &no_parents).unwrap();

        let ada = records.get(0).unwrap();
        assert_eq!(ada.get_str("FirstName").as_deref(), Some("ADA"));
        assert_eq!(ada.get_str("Description").as_deref(), Some("ADA Lovelace"));
        assert_eq!(ada.get_str("Migration_Key__c").unwrap().len(), 36);

        // Null first name is skipped by concat and left null by upper
        let grace = records.get(1).unwrap();
        assert_eq!(grace.get("FirstName"), Some(&Value::Null));
        assert_eq!(grace.get_str("Description").as_deref(), Some("Hopper"));
    }

    #[test]
    fn test_lookup_copy_reads_parent_source_record() {
        let accounts = RecordSet::from_records(
            vec![Record::new().with("Id", "001A").with("Industry", "Energy")],
            vec!["Name".to_string()],
        );
        let parents = |entity: &str| (entity == "Account").then_some(&accounts);

        let mut records = contacts();
        let transforms = vec![ValueTransform::LookupCopy {
            lookup: "AccountId".to_string(),
            entity: "Account".to_string(),
            field: "Industry".to_string(),
            to: "Account_Industry__c".to_string(),
        }];
        apply_transforms("Contact", &transforms, &mut records, &parents).unwrap();

        assert_eq!(
            records.get(0).unwrap().get_str("Account_Industry__c").as_deref(),
            Some("Energy")
        );
        assert_eq!(
            records.get(1).unwrap().get("Account_Industry__c"),
            Some(&Value::Null)
        );
    }

    #[test]
    fn test_lookup_copy_to_unknown_entity_fails() {
        let mut records = contacts();
        let transforms = vec![ValueTransform::LookupCopy {
            lookup: "AccountId".to_string(),
            entity: "Account".to_string(),
            field: "Industry".to_string(),
            to: "Account_Industry__c".to_string(),
        }];
        let err = apply_transforms("Contact", &transforms, &mut records, &no_parents).unwrap_err();
        assert!(matches!(err, MigrationError::Transform { .. }));
    }
}
