//! Migration task: one entity's source and target records, the map between
//! them and the writes derived from it

mod lookups;
mod reconcile;
mod transform;
mod write;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::engine::{CrudOutcome, EngineKind};
use crate::metadata::EntityDescribe;
use crate::model::{EntityDescriptor, ID_FIELD, QuerySpec, Record, RecordSet};

pub use lookups::*;
pub use reconcile::ReconcileStats;
pub use transform::{apply_transform, apply_transforms};
pub use write::PlannedWrite;

/// Per-task record counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TaskCounts {
    pub source: usize,
    pub target: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub unprocessed: usize,
    pub missing_parents: usize,
}

impl TaskCounts {
    pub fn add(&mut self, other: &TaskCounts) {
        self.source += other.source;
        self.target += other.target;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.unprocessed += other.unprocessed;
        self.missing_parents += other.missing_parents;
    }

    /// Records written successfully
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// One entity's unit of work for a run
#[derive(Debug)]
pub struct MigrationTask {
    pub descriptor: EntityDescriptor,
    pub source: RecordSet,
    pub target: RecordSet,
    /// Target-side metadata, when an org describes it
    pub target_describe: Option<Arc<EntityDescribe>>,
    pub counts: TaskCounts,
    pub missing_parents: Vec<MissingParentEntry>,
    pub outcomes: Vec<CrudOutcome>,
    /// Engine used by the last write
    pub engine: Option<EngineKind>,
    source_to_target: HashMap<usize, usize>,
    payloads: HashMap<usize, Record>,
    deferred: Vec<DeferredLookup>,
}

impl MigrationTask {
    pub fn new(descriptor: EntityDescriptor) -> Self {
        let source_keys = descriptor.external_id.clone();
        let target_keys = descriptor.target_external_id();
        MigrationTask {
            descriptor,
            source: RecordSet::new(source_keys),
            target: RecordSet::new(target_keys),
            target_describe: None,
            counts: TaskCounts::default(),
            missing_parents: Vec::new(),
            outcomes: Vec::new(),
            engine: None,
            source_to_target: HashMap::new(),
            payloads: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Replace the source records
    pub fn load_source(&mut self, records: Vec<Record>) {
        self.counts.source = records.len();
        self.source = RecordSet::from_records(records, self.descriptor.external_id.clone());
    }

    /// Replace the target records
    pub fn load_target(&mut self, records: Vec<Record>) {
        self.counts.target = records.len();
        self.target = RecordSet::from_records(records, self.descriptor.target_external_id());
    }

    /// Rebuild the source indexes after records were rewritten in place
    pub fn rebuild_source_index(&mut self) {
        let records: Vec<Record> = self.source.iter().map(|(_, r)| r.clone()).collect();
        self.load_source(records);
    }

    /// Query for the matching records on the target side
    pub fn target_query(&self) -> QuerySpec {
        let query = &self.descriptor.query;
        let mut target = QuerySpec::select(self.descriptor.target_entity(), &[ID_FIELD]);
        for field in &query.fields {
            target.add_field(self.descriptor.target_field(field));
        }
        for field in self.descriptor.target_external_id() {
            target.add_field(field);
        }
        target.filter = query.filter.clone();
        target
    }

    /// Whether existing target records matter to this task
    pub fn needs_target_records(&self) -> bool {
        use crate::model::CrudOperation::*;
        self.descriptor.delete_old_data
            || matches!(
                self.descriptor.operation,
                Update | Upsert | Readonly | Delete | HardDelete | DeleteHierarchy
            )
    }

    pub fn source_to_target(&self) -> &HashMap<usize, usize> {
        &self.source_to_target
    }

    /// Target position matched to a source position
    pub fn target_of(&self, source: usize) -> Option<usize> {
        self.source_to_target.get(&source).copied()
    }

    /// Target Id matched to a source position
    pub fn target_id_of(&self, source: usize) -> Option<String> {
        self.target_of(source)
            .and_then(|t| self.target.get(t))
            .and_then(|r| r.id())
    }

    /// Prepared payload of a source record
    pub fn payload(&self, source: usize) -> Option<&Record> {
        self.payloads.get(&source)
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn deferred(&self) -> &[DeferredLookup] {
        &self.deferred
    }

    /// Business key (or Id) of a source record for messages
    pub fn describe_source(&self, source: usize) -> String {
        self.source
            .key_of(source)
            .or_else(|| self.source.get(source).and_then(|r| r.id()))
            .unwrap_or_else(|| format!("#{}", source + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CrudOperation, FieldMapping};

    #[test]
    fn test_target_query_uses_mapped_names() {
        let mut descriptor = EntityDescriptor::new(
            QuerySpec::parse("SELECT Id, Name, Code__c FROM Account WHERE Type = 'Customer'")
                .unwrap(),
            CrudOperation::Upsert,
        )
        .with_external_id(&["Code__c"]);
        descriptor.field_mapping = Some(FieldMapping {
            target_entity: Some("Customer__c".to_string()),
            fields: [("Code__c".to_string(), "Legacy_Code__c".to_string())]
                .into_iter()
                .collect(),
        });
        let task = MigrationTask::new(descriptor);
        let query = task.target_query();
        assert_eq!(query.entity, "Customer__c");
        assert_eq!(query.fields, vec!["Id", "Name", "Legacy_Code__c"]);
        assert_eq!(query.filter.as_deref(), Some("Type = 'Customer'"));
    }

    #[test]
    fn test_insert_only_tasks_skip_target_reads() {
        let descriptor = EntityDescriptor::new(
            QuerySpec::select("Account", &["Id", "Name"]),
            CrudOperation::Insert,
        );
        let mut task = MigrationTask::new(descriptor);
        assert!(!task.needs_target_records());
        task.descriptor.delete_old_data = true;
        assert!(task.needs_target_records());
    }

    #[test]
    fn test_counts_accumulate() {
        let mut total = TaskCounts::default();
        total.add(&TaskCounts {
            inserted: 2,
            updated: 1,
            failed: 1,
            ..Default::default()
        });
        total.add(&TaskCounts {
            deleted: 3,
            ..Default::default()
        });
        assert_eq!(total.written(), 6);
        assert_eq!(total.failed, 1);
    }
}
