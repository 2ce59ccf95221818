//! In-memory org used by the test suites
//!
//! Stores records per entity, answers describes and flat `Rel.Field` query
//! paths, and implements the REST, Bulk v1 and Bulk v2 traits with call
//! counters and failure switches. Records carrying the value `__fail__` fail
//! individually; records carrying `__stall__` keep their batch or job
//! in progress forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    BatchInfo, BatchState, BulkV1Api, BulkV2Api, JobInfo, JobState, OrgConnection, RecordResult,
    RestApi, ResultSet,
};
use crate::error::{MigrationError, Result};
use crate::metadata::EntityDescribe;
use crate::model::{ApiOperation, QuerySpec, Record, value_to_string};

pub const FAIL_MARKER: &str = "__fail__";
pub const STALL_MARKER: &str = "__stall__";
/// Bulk v2 jobs leave records carrying this value unprocessed
pub const SKIP_MARKER: &str = "__skip__";

/// Call counters
#[derive(Debug, Default)]
pub struct CallCounters {
    pub describes: AtomicUsize,
    pub queries: AtomicUsize,
    pub rest_calls: AtomicUsize,
    pub bulk_jobs: AtomicUsize,
    pub batches: AtomicUsize,
    pub uploads: AtomicUsize,
    pub polls: AtomicUsize,
}

impl CallCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Every remote call of any kind
    pub fn total(&self) -> usize {
        [
            &self.describes,
            &self.queries,
            &self.rest_calls,
            &self.bulk_jobs,
            &self.batches,
            &self.uploads,
            &self.polls,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    /// Calls that write or poll (everything but describe and query)
    pub fn write_calls(&self) -> usize {
        self.total() - Self::get(&self.describes) - Self::get(&self.queries)
    }
}

struct V1Batch {
    results: Vec<RecordResult>,
    polls_left: usize,
    stalled: bool,
}

struct V1Job {
    entity: String,
    operation: ApiOperation,
    batches: HashMap<String, V1Batch>,
}

struct V2Job {
    entity: String,
    operation: ApiOperation,
    uploaded: Vec<Record>,
    results: Vec<(Record, RecordResult)>,
    polls_left: usize,
    stalled: bool,
    failure: Option<String>,
}

#[derive(Default)]
struct OrgState {
    entities: HashMap<String, Vec<Record>>,
    next_id: u64,
    v1_jobs: HashMap<String, V1Job>,
    v2_jobs: HashMap<String, V2Job>,
    next_job: u64,
}

/// Test double for a connected org
pub struct InMemoryOrg {
    name: String,
    describes: HashMap<String, EntityDescribe>,
    state: Mutex<OrgState>,
    pub counters: CallCounters,
    has_rest: bool,
    has_bulk_v1: bool,
    has_bulk_v2: bool,
    polls_before_complete: usize,
    bulk_v1_failure: Option<String>,
    bulk_v2_failure: Option<String>,
    /// 1-based job ordinal the Bulk v2 failure applies to; every job when unset
    bulk_v2_failing_job: Option<usize>,
    bulk_v1_close_failure: bool,
    reverse_results: bool,
}

impl InMemoryOrg {
    pub fn new(name: &str) -> Self {
        InMemoryOrg {
            name: name.to_string(),
            describes: HashMap::new(),
            state: Mutex::new(OrgState::default()),
            counters: CallCounters::default(),
            has_rest: true,
            has_bulk_v1: true,
            has_bulk_v2: true,
            polls_before_complete: 0,
            bulk_v1_failure: None,
            bulk_v2_failure: None,
            bulk_v2_failing_job: None,
            bulk_v1_close_failure: false,
            reverse_results: false,
        }
    }

    /// Register an entity with its describe and initial records
    pub fn with_entity(mut self, describe: EntityDescribe, records: Vec<Record>) -> Self {
        let name = describe.name.clone();
        self.describes.insert(name.clone(), describe);
        self.state
            .get_mut()
            .unwrap()
            .entities
            .insert(name, records);
        self
    }

    pub fn without_rest(mut self) -> Self {
        self.has_rest = false;
        self
    }

    pub fn without_bulk_v1(mut self) -> Self {
        self.has_bulk_v1 = false;
        self
    }

    pub fn without_bulk_v2(mut self) -> Self {
        self.has_bulk_v2 = false;
        self
    }

    /// Batches and jobs report in-progress this many times before finishing
    pub fn with_polls_before_complete(mut self, polls: usize) -> Self {
        self.polls_before_complete = polls;
        self
    }

    pub fn with_bulk_v1_failure(mut self, message: &str) -> Self {
        self.bulk_v1_failure = Some(message.to_string());
        self
    }

    pub fn with_bulk_v2_failure(mut self, message: &str) -> Self {
        self.bulk_v2_failure = Some(message.to_string());
        self
    }

    /// Only the `job`-th Bulk v2 job (1-based) ends `Failed`
    pub fn with_bulk_v2_failure_on_job(mut self, job: usize, message: &str) -> Self {
        self.bulk_v2_failure = Some(message.to_string());
        self.bulk_v2_failing_job = Some(job);
        self
    }

    /// Closing a Bulk v1 job is rejected after its batches ran
    pub fn with_bulk_v1_close_failure(mut self) -> Self {
        self.bulk_v1_close_failure = true;
        self
    }

    /// Bulk v2 result sets come back in reverse upload order
    pub fn with_reversed_results(mut self) -> Self {
        self.reverse_results = true;
        self
    }

    /// Snapshot of an entity's stored records
    pub fn records(&self, entity: &str) -> Vec<Record> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(entity)
            .cloned()
            .unwrap_or_default()
    }

    fn has_marker(record: &Record, marker: &str) -> bool {
        record
            .fields()
            .values()
            .any(|v| v.as_str() == Some(marker))
    }

    fn generate_id(state: &mut OrgState, entity: &str) -> String {
        state.next_id += 1;
        let prefix: String = entity
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .chain("XXX".chars())
            .take(3)
            .collect::<String>()
            .to_uppercase();
        format!("{}{:015}", prefix, state.next_id)
    }

    fn apply(
        state: &mut OrgState,
        entity: &str,
        operation: ApiOperation,
        record: &Record,
    ) -> RecordResult {
        if Self::has_marker(record, FAIL_MARKER) {
            return RecordResult::failed("FIELD_CUSTOM_VALIDATION_EXCEPTION: rejected");
        }
        match operation {
            ApiOperation::Insert => {
                let id = Self::generate_id(state, entity);
                let mut stored = record.clone();
                stored.set_id(id.clone());
                state
                    .entities
                    .entry(entity.to_string())
                    .or_default()
                    .push(stored);
                RecordResult::ok(id, true)
            }
            ApiOperation::Update => {
                let Some(id) = record.id() else {
                    return RecordResult::failed("MISSING_ARGUMENT: Id not specified");
                };
                let stored = state
                    .entities
                    .get_mut(entity)
                    .and_then(|records| records.iter_mut().find(|r| r.id().as_deref() == Some(&id)));
                match stored {
                    Some(existing) => {
                        existing.merge(record);
                        RecordResult::ok(id, false)
                    }
                    None => RecordResult::failed("ENTITY_IS_DELETED: entity is deleted"),
                }
            }
            ApiOperation::Delete | ApiOperation::HardDelete => {
                let Some(id) = record.id() else {
                    return RecordResult::failed("MISSING_ARGUMENT: Id not specified");
                };
                let records = state.entities.entry(entity.to_string()).or_default();
                let before = records.len();
                records.retain(|r| r.id().as_deref() != Some(&id));
                if records.len() < before {
                    RecordResult::ok(id, false)
                } else {
                    RecordResult::failed("ENTITY_IS_DELETED: entity is deleted")
                }
            }
        }
    }

    fn resolve_path(&self, state: &OrgState, entity: &str, record: &Record, path: &str) -> Value {
        let Some((relationship, field)) = path.split_once('.') else {
            return record.get(path).cloned().unwrap_or(Value::Null);
        };
        let Some(lookup) = self
            .describes
            .get(entity)
            .and_then(|d| d.lookup_by_relationship(relationship))
        else {
            return Value::Null;
        };
        let Some(parent_id) = record.get_str(&lookup.name) else {
            return Value::Null;
        };
        for referenced in &lookup.referenced_entities {
            let parent = state
                .entities
                .get(referenced)
                .and_then(|records| records.iter().find(|r| r.id().as_deref() == Some(&parent_id)));
            if let Some(parent) = parent {
                return parent.get(field).cloned().unwrap_or(Value::Null);
            }
        }
        Value::Null
    }

    fn next_job_id(state: &mut OrgState, prefix: &str) -> String {
        state.next_job += 1;
        format!("{}{:015}", prefix, state.next_job)
    }
}

fn as_result_row(record: &Record, result: &RecordResult) -> Record {
    let mut row = Record::new();
    row.set("sf__Id", result.id.clone().unwrap_or_default());
    if result.success {
        row.set("sf__Created", result.created.to_string());
    } else {
        row.set("sf__Error", result.error.clone().unwrap_or_default());
    }
    for (name, value) in record.fields() {
        let text = value_to_string(value).map(Value::String).unwrap_or(Value::Null);
        row.set(name.clone(), text);
    }
    row
}

#[async_trait]
impl OrgConnection for InMemoryOrg {
    fn name(&self) -> &str {
        &self.name
    }

    async fn describe(&self, entity: &str) -> Result<EntityDescribe> {
        self.counters.describes.fetch_add(1, Ordering::SeqCst);
        self.describes
            .get(entity)
            .cloned()
            .ok_or_else(|| MigrationError::Api {
                status: 404,
                message: format!("NOT_FOUND: sObject type '{}' is not supported", entity),
            })
    }

    async fn query(&self, soql: &str) -> Result<Vec<Record>> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        let spec = QuerySpec::parse(soql)?;
        let state = self.state.lock().unwrap();
        let stored = state.entities.get(&spec.entity).cloned().unwrap_or_default();
        let mut rows: Vec<Record> = stored
            .iter()
            .map(|record| {
                let mut row = Record::new();
                for field in &spec.fields {
                    row.set(
                        field.clone(),
                        self.resolve_path(&state, &spec.entity, record, field),
                    );
                }
                row
            })
            .collect();
        if let Some(limit) = spec.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn rest(&self) -> Option<&dyn RestApi> {
        self.has_rest.then_some(self as &dyn RestApi)
    }

    fn bulk_v1(&self) -> Option<&dyn BulkV1Api> {
        self.has_bulk_v1.then_some(self as &dyn BulkV1Api)
    }

    fn bulk_v2(&self) -> Option<&dyn BulkV2Api> {
        self.has_bulk_v2.then_some(self as &dyn BulkV2Api)
    }
}

#[async_trait]
impl RestApi for InMemoryOrg {
    async fn execute(
        &self,
        entity: &str,
        operation: ApiOperation,
        records: &[Record],
        _all_or_none: bool,
    ) -> Result<Vec<RecordResult>> {
        self.counters.rest_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        Ok(records
            .iter()
            .map(|r| Self::apply(&mut state, entity, operation, r))
            .collect())
    }
}

#[async_trait]
impl BulkV1Api for InMemoryOrg {
    async fn create_job(&self, entity: &str, operation: ApiOperation) -> Result<String> {
        self.counters.bulk_jobs.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let id = Self::next_job_id(&mut state, "750");
        state.v1_jobs.insert(
            id.clone(),
            V1Job {
                entity: entity.to_string(),
                operation,
                batches: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn add_batch(&self, job_id: &str, records: &[Record]) -> Result<String> {
        self.counters.batches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let batch_id = Self::next_job_id(&mut state, "751");
        let (entity, operation) = match state.v1_jobs.get(job_id) {
            Some(job) => (job.entity.clone(), job.operation),
            None => {
                return Err(MigrationError::Api {
                    status: 400,
                    message: format!("Unknown job {}", job_id),
                });
            }
        };
        let stalled = records.iter().any(|r| Self::has_marker(r, STALL_MARKER));
        let results = if self.bulk_v1_failure.is_some() || stalled {
            Vec::new()
        } else {
            records
                .iter()
                .map(|r| Self::apply(&mut state, &entity, operation, r))
                .collect()
        };
        let polls_left = self.polls_before_complete;
        if let Some(job) = state.v1_jobs.get_mut(job_id) {
            job.batches.insert(
                batch_id.clone(),
                V1Batch {
                    results,
                    polls_left,
                    stalled,
                },
            );
        }
        Ok(batch_id)
    }

    async fn close_job(&self, job_id: &str) -> Result<()> {
        if self.bulk_v1_close_failure {
            return Err(MigrationError::Api {
                status: 500,
                message: format!("Cannot close job {}", job_id),
            });
        }
        Ok(())
    }

    async fn batch_status(&self, job_id: &str, batch_id: &str) -> Result<BatchInfo> {
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let batch = state
            .v1_jobs
            .get_mut(job_id)
            .and_then(|job| job.batches.get_mut(batch_id))
            .ok_or_else(|| MigrationError::Api {
                status: 404,
                message: format!("Unknown batch {}", batch_id),
            })?;

        let in_progress = BatchInfo {
            state: BatchState::InProgress,
            processed: 0,
            failed: 0,
            message: None,
        };
        if batch.stalled {
            return Ok(in_progress);
        }
        if batch.polls_left > 0 {
            batch.polls_left -= 1;
            return Ok(in_progress);
        }
        if let Some(message) = &self.bulk_v1_failure {
            return Ok(BatchInfo {
                state: BatchState::Failed,
                processed: 0,
                failed: 0,
                message: Some(message.clone()),
            });
        }
        Ok(BatchInfo {
            state: BatchState::Completed,
            processed: batch.results.len(),
            failed: batch.results.iter().filter(|r| !r.success).count(),
            message: None,
        })
    }

    async fn batch_results(&self, job_id: &str, batch_id: &str) -> Result<Vec<RecordResult>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .v1_jobs
            .get(job_id)
            .and_then(|job| job.batches.get(batch_id))
            .map(|batch| batch.results.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl BulkV2Api for InMemoryOrg {
    async fn create_job(&self, entity: &str, operation: ApiOperation) -> Result<String> {
        let ordinal = self.counters.bulk_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = self
            .bulk_v2_failure
            .clone()
            .filter(|_| self.bulk_v2_failing_job.is_none_or(|job| job == ordinal));
        let mut state = self.state.lock().unwrap();
        let id = Self::next_job_id(&mut state, "750");
        state.v2_jobs.insert(
            id.clone(),
            V2Job {
                entity: entity.to_string(),
                operation,
                uploaded: Vec::new(),
                results: Vec::new(),
                polls_left: self.polls_before_complete,
                stalled: false,
                failure,
            },
        );
        Ok(id)
    }

    async fn upload(&self, job_id: &str, records: &[Record]) -> Result<()> {
        self.counters.uploads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.v2_jobs.get_mut(job_id) {
            job.uploaded.extend(records.iter().cloned());
        }
        Ok(())
    }

    async fn close_job(&self, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.v2_jobs.remove(job_id) else {
            return Ok(());
        };
        let mut job = job;
        job.stalled = job.uploaded.iter().any(|r| Self::has_marker(r, STALL_MARKER));
        if job.failure.is_none() && !job.stalled {
            let (skipped, uploaded): (Vec<Record>, Vec<Record>) = std::mem::take(&mut job.uploaded)
                .into_iter()
                .partition(|r| Self::has_marker(r, SKIP_MARKER));
            for record in uploaded {
                let result = Self::apply(&mut state, &job.entity, job.operation, &record);
                job.results.push((record, result));
            }
            job.uploaded = skipped;
        }
        state.v2_jobs.insert(job_id.to_string(), job);
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobInfo> {
        self.counters.polls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let job = state.v2_jobs.get_mut(job_id).ok_or_else(|| MigrationError::Api {
            status: 404,
            message: format!("Unknown job {}", job_id),
        })?;

        let in_progress = JobInfo {
            state: JobState::InProgress,
            processed: 0,
            failed: 0,
            message: None,
        };
        if job.stalled {
            return Ok(in_progress);
        }
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(in_progress);
        }
        if let Some(message) = &job.failure {
            return Ok(JobInfo {
                state: JobState::Failed,
                processed: 0,
                failed: 0,
                message: Some(message.clone()),
            });
        }
        Ok(JobInfo {
            state: JobState::JobComplete,
            processed: job.results.len(),
            failed: job.results.iter().filter(|(_, r)| !r.success).count(),
            message: None,
        })
    }

    async fn results(&self, job_id: &str, set: ResultSet) -> Result<Vec<Record>> {
        let state = self.state.lock().unwrap();
        let Some(job) = state.v2_jobs.get(job_id) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<Record> = match set {
            ResultSet::Successful => job
                .results
                .iter()
                .filter(|(_, r)| r.success)
                .map(|(record, r)| as_result_row(record, r))
                .collect(),
            ResultSet::Failed => job
                .results
                .iter()
                .filter(|(_, r)| !r.success)
                .map(|(record, r)| as_result_row(record, r))
                .collect(),
            ResultSet::Unprocessed => job.uploaded.clone(),
        };
        if self.reverse_results {
            rows.reverse();
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldDescribe, FieldType};

    fn org() -> InMemoryOrg {
        InMemoryOrg::new("target")
            .with_entity(
                EntityDescribe::new(
                    "Account",
                    vec![
                        FieldDescribe::new("Id", FieldType::Id),
                        FieldDescribe::new("Name", FieldType::String),
                    ],
                ),
                vec![Record::new().with("Id", "ACC000000000000001").with("Name", "Acme")],
            )
            .with_entity(
                EntityDescribe::new(
                    "Contact",
                    vec![
                        FieldDescribe::new("Id", FieldType::Id),
                        FieldDescribe::lookup("AccountId", "Account", "Account"),
                    ],
                ),
                vec![
                    Record::new()
                        .with("Id", "CON000000000000001")
                        .with("AccountId", "ACC000000000000001"),
                ],
            )
    }

    #[tokio::test]
    async fn test_query_resolves_relationship_paths() {
        let org = org();
        let rows = org
            .query("SELECT Id, Account.Name FROM Contact")
            .await
            .unwrap();
        assert_eq!(rows[0].get_str("Account.Name").as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_rest_insert_generates_18_char_ids() {
        let org = org();
        let results = org
            .rest()
            .unwrap()
            .execute("Account", ApiOperation::Insert, &[Record::new().with("Name", "New")], false)
            .await
            .unwrap();
        assert_eq!(results[0].id.as_ref().unwrap().len(), 18);
        assert_eq!(org.records("Account").len(), 2);
    }
}
