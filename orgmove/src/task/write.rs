//! Payload preparation, write planning and outcome application

use std::collections::BTreeMap;

use log::{debug, warn};
use serde_json::Value;

use super::lookups::{DeferredLookup, LookupContext, MissingParentEntry, Resolution, resolve_lookup};
use super::MigrationTask;
use crate::config::MissingParentPolicy;
use crate::engine::{CrudOutcome, EngineRecord, RecordHandle};
use crate::error::{MigrationError, Result};
use crate::model::{
    ApiOperation, CrudOperation, ID_FIELD, LookupField, Record, is_comparable_field, subset_hash,
};

/// Records to send through one API operation
#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub operation: ApiOperation,
    pub records: Vec<EngineRecord>,
}

impl PlannedWrite {
    fn new(operation: ApiOperation) -> Self {
        PlannedWrite {
            operation,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn delete_operation(operation: CrudOperation) -> ApiOperation {
    match operation {
        CrudOperation::HardDelete => ApiOperation::HardDelete,
        _ => ApiOperation::Delete,
    }
}

fn id_only(id: String) -> Record {
    Record::new().with(ID_FIELD, id)
}

impl MigrationTask {
    /// Source fields copied into payloads for an API operation
    fn writable_fields(&self, operation: ApiOperation) -> Vec<String> {
        let descriptor = &self.descriptor;
        let mut fields: Vec<String> = descriptor.query.fields.clone();
        for transform in &descriptor.transforms {
            let target = transform.target_field().to_string();
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(&target)) {
                fields.push(target);
            }
        }

        fields
            .into_iter()
            .filter(|f| !f.contains('.'))
            .filter(|f| is_comparable_field(f, &descriptor.excluded_fields))
            .filter(|f| match &self.target_describe {
                None => true,
                Some(describe) => match describe.field(descriptor.target_field(f)) {
                    None => false,
                    Some(field) if operation == ApiOperation::Insert => field.creatable,
                    Some(field) => field.updateable,
                },
            })
            .collect()
    }

    fn resolve_into(
        &mut self,
        source: usize,
        record: &Record,
        lookup: &LookupField,
        ctx: &LookupContext,
        policy: MissingParentPolicy,
        payload: &mut Record,
    ) -> Result<()> {
        let target_field = self.descriptor.target_field(&lookup.field).to_string();
        match resolve_lookup(record, lookup, ctx) {
            Resolution::Resolved(id) => payload.set(target_field, id),
            Resolution::Empty => payload.set(target_field, Value::Null),
            Resolution::Deferred => {
                payload.set(target_field, Value::Null);
                self.deferred.push(DeferredLookup {
                    source,
                    lookup: lookup.clone(),
                });
            }
            Resolution::Missing(value) => {
                self.missing_parent(source, lookup, value, policy)?;
                payload.set(target_field, Value::Null);
            }
        }
        Ok(())
    }

    fn missing_parent(
        &mut self,
        source: usize,
        lookup: &LookupField,
        value: String,
        policy: MissingParentPolicy,
    ) -> Result<()> {
        let referenced = lookup.referenced_entities.join("/");
        if policy == MissingParentPolicy::Abort {
            return Err(MigrationError::MissingParent {
                entity: self.descriptor.name.clone(),
                field: lookup.field.clone(),
                value,
                referenced,
            });
        }
        let record = self.describe_source(source);
        warn!(
            "{} {}: no {} parent for {} = '{}'; value cleared",
            self.descriptor.name, record, referenced, lookup.field, value
        );
        self.counts.missing_parents += 1;
        self.missing_parents.push(MissingParentEntry {
            entity: self.descriptor.name.clone(),
            record,
            field: lookup.field.clone(),
            value,
            referenced,
        });
        Ok(())
    }

    /// Build target-side payloads for every source record that will be written
    ///
    /// Lookups are resolved against `ctx`; parents that run later are left
    /// empty and queued for the deferred pass.
    pub fn prepare_payloads(
        &mut self,
        ctx: &LookupContext,
        policy: MissingParentPolicy,
    ) -> Result<usize> {
        self.payloads.clear();
        self.deferred.clear();

        let operation = self.descriptor.operation;
        if !operation.writes_target() {
            return Ok(0);
        }
        let insert_fields = self.writable_fields(ApiOperation::Insert);
        let update_fields = self.writable_fields(ApiOperation::Update);

        let positions: Vec<usize> = self.source.iter().map(|(s, _)| s).collect();
        for s in positions {
            let matched = self.target_id_of(s);
            if operation == CrudOperation::Update && matched.is_none() {
                continue;
            }
            if operation == CrudOperation::Insert && matched.is_some() {
                debug!(
                    "{}: {} already exists in the target and is inserted again",
                    self.descriptor.name,
                    self.describe_source(s)
                );
            }
            let Some(record) = self.source.get(s).cloned() else {
                continue;
            };

            let fields = match (&matched, operation) {
                (Some(_), CrudOperation::Update | CrudOperation::Upsert) => &update_fields,
                _ => &insert_fields,
            };
            let mut payload = Record::new();
            for field in fields {
                match self.descriptor.lookup(field).cloned() {
                    Some(lookup) => {
                        self.resolve_into(s, &record, &lookup, ctx, policy, &mut payload)?
                    }
                    None => payload.set(
                        self.descriptor.target_field(field),
                        record.get(field).cloned().unwrap_or(Value::Null),
                    ),
                }
            }
            if operation != CrudOperation::Insert {
                if let Some(id) = matched {
                    payload.set_id(id);
                }
            }
            self.payloads.insert(s, payload);
        }
        Ok(self.payloads.len())
    }

    /// Whether an update payload would leave the target record as it is
    fn is_unchanged(&self, payload: &Record, target: usize) -> bool {
        let Some(existing) = self.target.get(target) else {
            return false;
        };
        let fields: Vec<String> = payload
            .field_names()
            .filter(|f| f.as_str() != ID_FIELD)
            .cloned()
            .collect();
        subset_hash(payload, &fields) == subset_hash(existing, &fields)
    }

    /// Writes of the main pass, in the order they must run
    pub fn plan_writes(&mut self) -> Vec<PlannedWrite> {
        let operation = self.descriptor.operation;
        let mut inserts = PlannedWrite::new(ApiOperation::Insert);
        let mut updates = PlannedWrite::new(ApiOperation::Update);
        let mut deletes = PlannedWrite::new(delete_operation(operation));

        match operation {
            CrudOperation::Insert | CrudOperation::Update | CrudOperation::Upsert => {
                let mut payloads: Vec<(usize, Record)> = self.payloads.drain().collect();
                payloads.sort_by_key(|(s, _)| *s);
                for (s, payload) in payloads {
                    match self.target_of(s) {
                        Some(t) if operation != CrudOperation::Insert => {
                            if self.is_unchanged(&payload, t) {
                                self.counts.unchanged += 1;
                            } else {
                                updates
                                    .records
                                    .push(EngineRecord::new(RecordHandle::pair(s, t), payload));
                            }
                        }
                        _ => inserts
                            .records
                            .push(EngineRecord::new(RecordHandle::source(s), payload)),
                    }
                }
            }
            CrudOperation::Delete | CrudOperation::HardDelete => {
                let mut matched: Vec<(usize, usize)> =
                    self.source_to_target.iter().map(|(&s, &t)| (s, t)).collect();
                matched.sort_unstable();
                for (s, t) in matched {
                    if let Some(id) = self.target.get(t).and_then(|r| r.id()) {
                        deletes
                            .records
                            .push(EngineRecord::new(RecordHandle::pair(s, t), id_only(id)));
                    }
                }
            }
            CrudOperation::DeleteSource => {
                for (s, record) in self.source.iter() {
                    if let Some(id) = record.id() {
                        deletes
                            .records
                            .push(EngineRecord::new(RecordHandle::source(s), id_only(id)));
                    }
                }
            }
            CrudOperation::Readonly | CrudOperation::DeleteHierarchy => {}
        }

        [inserts, updates, deletes]
            .into_iter()
            .filter(|w| !w.is_empty())
            .collect()
    }

    /// Deletes of the purge pass: every retrieved target record when old data
    /// is purged, the matched ones for `DeleteHierarchy`
    pub fn plan_purge(&self) -> Option<PlannedWrite> {
        let mut write = PlannedWrite::new(ApiOperation::Delete);
        if self.descriptor.delete_old_data {
            for (t, record) in self.target.iter() {
                if let Some(id) = record.id() {
                    write
                        .records
                        .push(EngineRecord::new(RecordHandle::target(t), id_only(id)));
                }
            }
        } else if self.descriptor.operation == CrudOperation::DeleteHierarchy {
            let mut matched: Vec<(usize, usize)> =
                self.source_to_target.iter().map(|(&s, &t)| (s, t)).collect();
            matched.sort_unstable();
            for (s, t) in matched {
                if let Some(id) = self.target.get(t).and_then(|r| r.id()) {
                    write
                        .records
                        .push(EngineRecord::new(RecordHandle::pair(s, t), id_only(id)));
                }
            }
        }
        (!write.is_empty()).then_some(write)
    }

    /// Updates filling in lookups whose parents were not available in the
    /// main pass; values still unresolved become missing parents
    pub fn plan_deferred(
        &mut self,
        ctx: &LookupContext,
        policy: MissingParentPolicy,
    ) -> Result<Option<PlannedWrite>> {
        let deferred = std::mem::take(&mut self.deferred);
        let mut updates: BTreeMap<(usize, usize), Record> = BTreeMap::new();

        for DeferredLookup { source, lookup } in deferred {
            let (Some(t), Some(id)) = (self.target_of(source), self.target_id_of(source)) else {
                continue;
            };
            let Some(record) = self.source.get(source).cloned() else {
                continue;
            };
            match resolve_lookup(&record, &lookup, ctx) {
                Resolution::Resolved(parent) => {
                    let field = self.descriptor.target_field(&lookup.field).to_string();
                    updates
                        .entry((source, t))
                        .or_insert_with(|| id_only(id))
                        .set(field, parent);
                }
                Resolution::Empty => {}
                Resolution::Deferred | Resolution::Missing(_) => {
                    let value = record
                        .get_str(&lookup.field)
                        .unwrap_or_else(|| "(key path)".to_string());
                    self.missing_parent(source, &lookup, value, policy)?;
                }
            }
        }

        if updates.is_empty() {
            return Ok(None);
        }
        let mut write = PlannedWrite::new(ApiOperation::Update);
        write.records = updates
            .into_iter()
            .map(|((s, t), record)| EngineRecord::new(RecordHandle::pair(s, t), record))
            .collect();
        Ok(Some(write))
    }

    /// Write outcomes back onto the task's records
    pub fn apply_outcomes(&mut self, operation: ApiOperation, outcomes: Vec<CrudOutcome>) {
        for outcome in outcomes {
            let handle = outcome.handle;
            if outcome.is_failed {
                self.counts.failed += 1;
                if outcome.is_unprocessed {
                    self.counts.unprocessed += 1;
                }
                let message = outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string());
                let record = match (handle.source, handle.target) {
                    (Some(s), _) => self.source.get_mut(s),
                    (None, Some(t)) => self.target.get_mut(t),
                    (None, None) => None,
                };
                if let Some(record) = record {
                    record.set_error(message);
                }
                self.outcomes.push(outcome);
                continue;
            }

            match operation {
                ApiOperation::Insert => {
                    let mut record = outcome.record.clone();
                    if record.id().is_none() {
                        if let Some(id) = &outcome.id {
                            record.set_id(id.clone());
                        }
                    }
                    let t = self.target.push(record);
                    if let Some(s) = handle.source {
                        self.source_to_target.insert(s, t);
                    }
                    self.counts.inserted += 1;
                }
                ApiOperation::Update => {
                    if let Some(t) = handle.target {
                        if let Some(existing) = self.target.get_mut(t) {
                            existing.merge(&outcome.record);
                        }
                        self.target.reindex(t);
                    }
                    self.counts.updated += 1;
                }
                ApiOperation::Delete | ApiOperation::HardDelete => {
                    match (handle.target, handle.source) {
                        (Some(t), _) => {
                            self.target.mark_removed(t);
                            self.source_to_target.retain(|_, v| *v != t);
                        }
                        (None, Some(s)) => self.source.mark_removed(s),
                        (None, None) => {}
                    }
                    self.counts.deleted += 1;
                }
            }
            self.outcomes.push(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityDescribe, FieldDescribe, FieldType};
    use crate::model::{EntityDescriptor, QuerySpec};
    use crate::task::ParentIndex;
    use std::sync::Arc;

    fn contact_task(operation: CrudOperation) -> MigrationTask {
        let mut descriptor = EntityDescriptor::new(
            QuerySpec::select("Contact", &["Id", "LastName", "Email", "AccountId", "Account.Name"]),
            operation,
        )
        .with_external_id(&["Email"]);
        descriptor.lookup_fields = vec![LookupField::new("AccountId", "Account", "Account")];
        let mut task = MigrationTask::new(descriptor);
        task.load_source(vec![
            Record::new()
                .with("Id", "S-C1")
                .with("LastName", "Lovelace")
                .with("Email", "ada@example.com")
                .with("AccountId", "S-A1")
                .with("Account.Name", "Acme"),
            Record::new()
                .with("Id", "S-C2")
                .with("LastName", "Hopper")
                .with("Email", "grace@example.com")
                .with("AccountId", "S-A9")
                .with("Account.Name", "Nowhere"),
        ]);
        task
    }

    fn accounts_done() -> LookupContext {
        let mut accounts = MigrationTask::new(
            EntityDescriptor::new(
                QuerySpec::select("Account", &["Id", "Name"]),
                CrudOperation::Readonly,
            )
            .with_external_id(&["Name"]),
        );
        accounts.load_source(vec![Record::new().with("Id", "S-A1").with("Name", "Acme")]);
        accounts.load_target(vec![Record::new().with("Id", "T-A1").with("Name", "Acme")]);
        accounts.reconcile();

        let mut ctx = LookupContext::new();
        ctx.schedule("Account", vec!["Name".to_string()]);
        ctx.schedule("Contact", vec!["Email".to_string()]);
        ctx.complete(ParentIndex::from_task(&accounts));
        ctx
    }

    fn succeed(write: &PlannedWrite, prefix: &str) -> Vec<CrudOutcome> {
        write
            .records
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let id = item
                    .record
                    .id()
                    .unwrap_or_else(|| format!("{}{}", prefix, i + 1));
                CrudOutcome::success(item.clone(), Some(id), item.record.id().is_none(), true)
            })
            .collect()
    }

    #[test]
    fn test_missing_parent_clear_policy() {
        let mut task = contact_task(CrudOperation::Insert);
        task.reconcile();
        task.prepare_payloads(&accounts_done(), MissingParentPolicy::Clear)
            .unwrap();

        let ada = task.payload(0).unwrap();
        assert_eq!(ada.get_str("AccountId").as_deref(), Some("T-A1"));
        assert!(!ada.contains("Account.Name"));
        assert!(!ada.contains("Id"));

        let grace = task.payload(1).unwrap();
        assert_eq!(grace.get("AccountId"), Some(&Value::Null));
        assert_eq!(task.counts.missing_parents, 1);
        assert_eq!(task.missing_parents[0].value, "S-A9");
        assert_eq!(task.missing_parents[0].record, "grace@example.com");
    }

    #[test]
    fn test_missing_parent_abort_policy() {
        let mut task = contact_task(CrudOperation::Insert);
        task.reconcile();
        let err = task
            .prepare_payloads(&accounts_done(), MissingParentPolicy::Abort)
            .unwrap_err();
        match err {
            MigrationError::MissingParent {
                entity,
                field,
                value,
                ..
            } => {
                assert_eq!(entity, "Contact");
                assert_eq!(field, "AccountId");
                assert_eq!(value, "S-A9");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_upsert_splits_and_skips_unchanged() {
        let mut task = contact_task(CrudOperation::Upsert);
        task.load_target(vec![
            Record::new()
                .with("Id", "T-C1")
                .with("LastName", "Lovelace")
                .with("Email", "ada@example.com")
                .with("AccountId", "T-A1"),
        ]);
        task.reconcile();
        task.prepare_payloads(&accounts_done(), MissingParentPolicy::Clear)
            .unwrap();

        let writes = task.plan_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].operation, ApiOperation::Insert);
        assert_eq!(writes[0].records[0].handle, RecordHandle::source(1));
        assert_eq!(task.counts.unchanged, 1);
    }

    #[test]
    fn test_changed_update_carries_target_id() {
        let mut task = contact_task(CrudOperation::Update);
        task.load_target(vec![
            Record::new()
                .with("Id", "T-C1")
                .with("LastName", "Byron")
                .with("Email", "ada@example.com")
                .with("AccountId", "T-A1"),
        ]);
        task.reconcile();
        task.prepare_payloads(&accounts_done(), MissingParentPolicy::Clear)
            .unwrap();

        let writes = task.plan_writes();
        assert_eq!(writes.len(), 1);
        let update = &writes[0];
        assert_eq!(update.operation, ApiOperation::Update);
        assert_eq!(update.records[0].handle, RecordHandle::pair(0, 0));
        assert_eq!(update.records[0].record.id().as_deref(), Some("T-C1"));

        let outcomes = succeed(update, "");
        task.apply_outcomes(ApiOperation::Update, outcomes);
        assert_eq!(task.counts.updated, 1);
        assert_eq!(
            task.target.get(0).unwrap().get_str("LastName").as_deref(),
            Some("Lovelace")
        );
    }

    #[test]
    fn test_inserts_extend_the_map() {
        let mut task = contact_task(CrudOperation::Insert);
        task.reconcile();
        task.prepare_payloads(&accounts_done(), MissingParentPolicy::Clear)
            .unwrap();
        let writes = task.plan_writes();
        let mut outcomes = succeed(&writes[0], "T-NEW");
        outcomes[1] = CrudOutcome::failed(writes[0].records[1].clone(), "REQUIRED_FIELD_MISSING");
        task.apply_outcomes(ApiOperation::Insert, outcomes);

        assert_eq!(task.counts.inserted, 1);
        assert_eq!(task.counts.failed, 1);
        assert_eq!(task.target_id_of(0).as_deref(), Some("T-NEW1"));
        assert_eq!(task.target_of(1), None);
        assert_eq!(
            task.source.get(1).unwrap().error().as_deref(),
            Some("REQUIRED_FIELD_MISSING")
        );
        let index = ParentIndex::from_task(&task);
        assert_eq!(index.by_source_id("S-C1"), Some("T-NEW1"));
    }

    #[test]
    fn test_inserts_map_ids_left_off_the_records() {
        let mut task = contact_task(CrudOperation::Insert);
        task.reconcile();
        task.prepare_payloads(&accounts_done(), MissingParentPolicy::Clear)
            .unwrap();
        let writes = task.plan_writes();
        let outcomes = writes[0]
            .records
            .iter()
            .enumerate()
            .map(|(i, item)| {
                CrudOutcome::success(item.clone(), Some(format!("T-RAW{}", i + 1)), true, false)
            })
            .collect();
        task.apply_outcomes(ApiOperation::Insert, outcomes);

        assert_eq!(task.counts.inserted, 2);
        assert_eq!(task.target_id_of(0).as_deref(), Some("T-RAW1"));
        assert_eq!(task.target_id_of(1).as_deref(), Some("T-RAW2"));
    }

    #[test]
    fn test_self_lookup_is_deferred_then_filled() {
        let mut descriptor = EntityDescriptor::new(
            QuerySpec::select("Account", &["Id", "Name", "ParentId"]),
            CrudOperation::Insert,
        )
        .with_external_id(&["Name"]);
        descriptor.lookup_fields = vec![LookupField::new("ParentId", "Parent", "Account")];
        let mut task = MigrationTask::new(descriptor);
        task.load_source(vec![
            Record::new()
                .with("Id", "S-1")
                .with("Name", "Child")
                .with("ParentId", "S-2"),
            Record::new()
                .with("Id", "S-2")
                .with("Name", "Parent")
                .with("ParentId", Value::Null),
        ]);
        task.reconcile();

        let mut ctx = LookupContext::new();
        ctx.schedule("Account", vec!["Name".to_string()]);
        task.prepare_payloads(&ctx, MissingParentPolicy::Abort).unwrap();
        assert!(task.has_deferred());
        assert_eq!(task.payload(0).unwrap().get("ParentId"), Some(&Value::Null));

        let writes = task.plan_writes();
        let outcomes = succeed(&writes[0], "T-");
        task.apply_outcomes(ApiOperation::Insert, outcomes);
        ctx.complete(ParentIndex::from_task(&task));

        let deferred = task
            .plan_deferred(&ctx, MissingParentPolicy::Abort)
            .unwrap()
            .unwrap();
        assert_eq!(deferred.operation, ApiOperation::Update);
        assert_eq!(deferred.records.len(), 1);
        let update = &deferred.records[0].record;
        assert_eq!(update.id().as_deref(), Some("T-1"));
        assert_eq!(update.get_str("ParentId").as_deref(), Some("T-2"));
        assert!(!task.has_deferred());
    }

    #[test]
    fn test_delete_targets_matched_records() {
        let mut task = contact_task(CrudOperation::HardDelete);
        task.load_target(vec![
            Record::new().with("Id", "T-C1").with("Email", "ada@example.com"),
            Record::new().with("Id", "T-C5").with("Email", "other@example.com"),
        ]);
        task.reconcile();
        let writes = task.plan_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].operation, ApiOperation::HardDelete);
        assert_eq!(writes[0].records[0].record.id().as_deref(), Some("T-C1"));

        let outcomes = succeed(&writes[0], "");
        task.apply_outcomes(ApiOperation::HardDelete, outcomes);
        assert_eq!(task.counts.deleted, 1);
        assert_eq!(task.target.len(), 1);
        assert!(task.source_to_target().is_empty());
    }

    #[test]
    fn test_purge_deletes_every_retrieved_target() {
        let mut task = contact_task(CrudOperation::Insert);
        task.descriptor.delete_old_data = true;
        task.load_target(vec![
            Record::new().with("Id", "T-C1").with("Email", "ada@example.com"),
            Record::new().with("Id", "T-C5").with("Email", "other@example.com"),
        ]);
        let purge = task.plan_purge().unwrap();
        assert_eq!(purge.len(), 2);
        assert_eq!(purge.records[1].handle, RecordHandle::target(1));
    }

    #[test]
    fn test_non_creatable_fields_left_out_of_inserts() {
        let mut task = contact_task(CrudOperation::Insert);
        task.target_describe = Some(Arc::new(EntityDescribe::new(
            "Contact",
            vec![
                FieldDescribe::new("Id", FieldType::Id),
                FieldDescribe::new("LastName", FieldType::String),
                FieldDescribe::new("Email", FieldType::String).read_only(),
                FieldDescribe::lookup("AccountId", "Account", "Account"),
            ],
        )));
        task.reconcile();
        task.prepare_payloads(&accounts_done(), MissingParentPolicy::Clear)
            .unwrap();
        let payload = task.payload(0).unwrap();
        assert!(payload.contains("LastName"));
        assert!(!payload.contains("Email"));
    }
}
