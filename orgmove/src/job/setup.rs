//! Setup: metadata, schedule, capability downgrades and task creation

use std::collections::HashMap;

use log::{debug, info, warn};

use super::{JobStage, MigrationJob};
use crate::error::{MigrationError, Result};
use crate::graph::build_schedule;
use crate::metadata::{EntityDescribe, Side};
use crate::model::{CrudOperation, EntityDescriptor, ID_FIELD, ValueTransform};
use crate::task::MigrationTask;

/// Operation the target entity can actually carry out
///
/// An Upsert loses the half the entity does not allow; an operation the
/// entity allows none of becomes Readonly.
pub fn downgrade_operation(operation: CrudOperation, describe: &EntityDescribe) -> CrudOperation {
    use CrudOperation::*;
    match operation {
        Upsert => match (describe.creatable, describe.updateable) {
            (true, true) => Upsert,
            (false, true) => Update,
            (true, false) => Insert,
            (false, false) => Readonly,
        },
        Insert if !describe.creatable => Readonly,
        Update if !describe.updateable => Readonly,
        Delete | HardDelete | DeleteHierarchy if !describe.deletable => Readonly,
        other => other,
    }
}

/// Add the fields a descriptor needs beyond what its query names
fn complete_query(descriptor: &mut EntityDescriptor, describe: &EntityDescribe) {
    if descriptor.query.all_fields {
        for field in &describe.fields {
            descriptor.query.add_field(field.name.clone());
        }
        debug!(
            "{}: SELECT all expanded to {} fields",
            descriptor.name,
            descriptor.query.fields.len()
        );
    }
    let read: Vec<String> = descriptor
        .transforms
        .iter()
        .flat_map(|t| t.source_fields())
        .filter(|f| describe.has_field(f))
        .map(str::to_string)
        .collect();
    for field in read {
        descriptor.query.add_field(field);
    }
}

/// Query the parents' business keys through each lookup's relationship
fn add_key_paths(descriptors: &mut [EntityDescriptor]) {
    let key_fields: HashMap<String, Vec<String>> = descriptors
        .iter()
        .map(|d| (d.name.clone(), d.external_id.clone()))
        .collect();

    for descriptor in descriptors.iter_mut() {
        let mut paths = Vec::new();
        for lookup in &descriptor.lookup_fields {
            for referenced in &lookup.referenced_entities {
                let Some(keys) = key_fields.get(referenced) else {
                    continue;
                };
                paths.extend(
                    keys.iter()
                        .filter(|k| k.as_str() != ID_FIELD)
                        .map(|k| lookup.key_path(k)),
                );
            }
        }
        for path in paths {
            descriptor.query.add_field(path);
        }
    }
}

impl MigrationJob {
    pub(super) async fn setup(&mut self) -> Result<()> {
        self.enter(JobStage::Setup);
        self.cancel.check()?;

        let mut descriptors = std::mem::take(&mut self.set.descriptors);
        for descriptor in descriptors.iter_mut() {
            let describe = self.metadata.describe(&descriptor.name, Side::Source).await?;
            complete_query(descriptor, &describe);
        }

        let mut schedule =
            build_schedule(descriptors, &mut self.metadata, &self.excluded_objects).await?;
        add_key_paths(&mut schedule.descriptors);

        for descriptor in &schedule.descriptors {
            for transform in &descriptor.transforms {
                if let ValueTransform::LookupCopy { entity, to, .. } = transform {
                    if schedule.descriptor(entity).is_none() {
                        return Err(MigrationError::configuration(format!(
                            "{}.{} copies from {}, which is not part of object-set '{}'",
                            descriptor.name, to, entity, self.set.name
                        )));
                    }
                }
            }
            if descriptor.operation == CrudOperation::DeleteSource && !self.source.is_org() {
                return Err(MigrationError::configuration(format!(
                    "{}: DeleteSource needs an org source, not {}",
                    descriptor.name,
                    self.source.label()
                )));
            }
        }

        let mut tasks = Vec::with_capacity(schedule.descriptors.len());
        for descriptor in schedule.descriptors.iter_mut() {
            let checks_target = self.target.is_org()
                && !matches!(
                    descriptor.operation,
                    CrudOperation::Readonly | CrudOperation::DeleteSource
                );
            let target_describe = if checks_target {
                let describe = self
                    .metadata
                    .describe(descriptor.target_entity(), Side::Target)
                    .await?;
                let allowed = downgrade_operation(descriptor.operation, &describe);
                if allowed != descriptor.operation {
                    warn!(
                        "{}: {} is not allowed on {}; running as {}",
                        descriptor.name,
                        descriptor.operation,
                        descriptor.target_entity(),
                        allowed
                    );
                    descriptor.operation = allowed;
                }
                Some(describe)
            } else {
                None
            };

            let mut task = MigrationTask::new(descriptor.clone());
            task.target_describe = target_describe;
            self.lookups
                .schedule(&descriptor.name, descriptor.external_id.clone());
            tasks.push(task);
        }

        info!(
            "Execution order: {}",
            schedule.execution_order().join(" -> ")
        );
        let auto_added = schedule.auto_added();
        if !auto_added.is_empty() {
            info!("Auto-added (readonly): {}", auto_added.join(", "));
        }

        self.tasks = tasks;
        self.schedule = Some(schedule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldDescribe, FieldType};
    use crate::model::QuerySpec;

    fn describe(creatable: bool, updateable: bool, deletable: bool) -> EntityDescribe {
        EntityDescribe {
            creatable,
            updateable,
            deletable,
            ..EntityDescribe::new("Account", vec![FieldDescribe::new("Name", FieldType::String)])
        }
    }

    #[test]
    fn test_downgrades() {
        use CrudOperation::*;
        assert_eq!(downgrade_operation(Upsert, &describe(true, true, true)), Upsert);
        assert_eq!(downgrade_operation(Upsert, &describe(false, true, true)), Update);
        assert_eq!(downgrade_operation(Upsert, &describe(true, false, true)), Insert);
        assert_eq!(downgrade_operation(Upsert, &describe(false, false, true)), Readonly);
        assert_eq!(downgrade_operation(Insert, &describe(false, true, true)), Readonly);
        assert_eq!(downgrade_operation(Update, &describe(true, false, true)), Readonly);
        assert_eq!(downgrade_operation(Delete, &describe(true, true, false)), Readonly);
        assert_eq!(downgrade_operation(HardDelete, &describe(true, true, false)), Readonly);
        assert_eq!(downgrade_operation(Delete, &describe(false, false, true)), Delete);
        assert_eq!(downgrade_operation(DeleteSource, &describe(false, false, false)), DeleteSource);
    }

    #[test]
    fn test_select_all_and_transform_inputs() {
        let all = EntityDescribe::new(
            "Contact",
            vec![
                FieldDescribe::new("Id", FieldType::Id),
                FieldDescribe::new("LastName", FieldType::String),
                FieldDescribe::new("Title", FieldType::String),
            ],
        );
        let mut descriptor = EntityDescriptor::new(
            QuerySpec::parse("SELECT all FROM Contact").unwrap(),
            CrudOperation::Insert,
        );
        complete_query(&mut descriptor, &all);
        assert_eq!(descriptor.query.fields, vec!["Id", "LastName", "Title"]);

        let mut descriptor = EntityDescriptor::new(
            QuerySpec::select("Contact", &["Id"]),
            CrudOperation::Insert,
        );
        descriptor.transforms = vec![
            ValueTransform::FieldCopy {
                from: "Title".to_string(),
                to: "Description".to_string(),
            },
            ValueTransform::FieldCopy {
                from: "Nickname__c".to_string(),
                to: "Description".to_string(),
            },
        ];
        complete_query(&mut descriptor, &all);
        assert_eq!(descriptor.query.fields, vec!["Id", "Title"]);
    }

    #[test]
    fn test_key_paths_follow_parent_external_id() {
        use crate::model::LookupField;

        let account = EntityDescriptor::new(
            QuerySpec::select("Account", &["Id", "Name"]),
            CrudOperation::Upsert,
        )
        .with_external_id(&["Name"]);
        let owner = EntityDescriptor::placeholder("User", vec!["Id".to_string()]);
        let mut contact = EntityDescriptor::new(
            QuerySpec::select("Contact", &["Id", "AccountId", "OwnerId"]),
            CrudOperation::Insert,
        );
        contact.lookup_fields = vec![
            LookupField::new("AccountId", "Account", "Account"),
            LookupField::new("OwnerId", "Owner", "User"),
        ];

        let mut descriptors = vec![account, owner, contact];
        add_key_paths(&mut descriptors);
        assert_eq!(
            descriptors[2].query.fields,
            vec!["Id", "AccountId", "OwnerId", "Account.Name"]
        );
    }
}
