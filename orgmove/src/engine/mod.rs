//! API engine framework
//!
//! Every engine implements one CRUD contract: take record copies tagged with
//! their task handles, write them through one API family and hand back a
//! [`CrudOutcome`] per record. Engine kinds are a closed set resolved once per
//! task by [`EngineKind::select`].

mod bulk_v1;
mod bulk_v2;
mod chunking;
mod concurrency;
mod poll;
mod rest;
mod simulation;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BulkApiVersion, ExecutionSettings};
use crate::error::{MigrationError, Result};
use crate::model::{ApiMode, ApiOperation, Record};
use crate::remote::{BulkV1Api, BulkV2Api, OrgConnection, RecordResult, RestApi};

pub use bulk_v1::BulkV1Engine;
pub use bulk_v2::BulkV2Engine;
pub use chunking::{chunk_records, run_chunks};
pub use concurrency::{ChunkPermit, ConcurrencyLimiter, ConcurrencyStats};
pub use poll::poll_until;
pub use rest::RestEngine;
pub use simulation::{SimulationEngine, simulated_id};

/// API family used for a task's writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Rest,
    BulkV1,
    BulkV2,
    Simulation,
}

impl EngineKind {
    /// Resolve the engine for a task
    ///
    /// Simulation wins over everything. An explicit mode is honoured as is;
    /// `auto` stays on REST below `bulk_threshold` records and switches to the
    /// configured bulk version at or above it. Hard deletes always go bulk.
    pub fn select(
        mode: ApiMode,
        record_count: usize,
        operation: ApiOperation,
        settings: &ExecutionSettings,
    ) -> Self {
        if settings.simulation {
            return EngineKind::Simulation;
        }
        let bulk = match settings.bulk_api {
            BulkApiVersion::V1 => EngineKind::BulkV1,
            BulkApiVersion::V2 => EngineKind::BulkV2,
        };
        match mode {
            ApiMode::Rest => EngineKind::Rest,
            ApiMode::BulkV1 => EngineKind::BulkV1,
            ApiMode::BulkV2 => EngineKind::BulkV2,
            ApiMode::Auto => {
                if operation == ApiOperation::HardDelete || record_count >= settings.bulk_threshold
                {
                    bulk
                } else {
                    EngineKind::Rest
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EngineKind::Rest => "REST API",
            EngineKind::BulkV1 => "Bulk API v1",
            EngineKind::BulkV2 => "Bulk API v2",
            EngineKind::Simulation => "Simulation",
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, EngineKind::BulkV1 | EngineKind::BulkV2)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Position of a record in its task's source and/or target arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecordHandle {
    pub source: Option<usize>,
    pub target: Option<usize>,
}

impl RecordHandle {
    pub fn source(idx: usize) -> Self {
        RecordHandle {
            source: Some(idx),
            target: None,
        }
    }

    pub fn target(idx: usize) -> Self {
        RecordHandle {
            source: None,
            target: Some(idx),
        }
    }

    pub fn pair(source: usize, target: usize) -> Self {
        RecordHandle {
            source: Some(source),
            target: Some(target),
        }
    }
}

/// A record copy handed to an engine
#[derive(Debug, Clone)]
pub struct EngineRecord {
    pub handle: RecordHandle,
    pub record: Record,
}

impl EngineRecord {
    pub fn new(handle: RecordHandle, record: Record) -> Self {
        EngineRecord { handle, record }
    }
}

/// Result of one record's write
#[derive(Debug, Clone)]
pub struct CrudOutcome {
    pub handle: RecordHandle,
    /// The record as sent, with its new Id when `update_record_id` was set
    pub record: Record,
    pub id: Option<String>,
    pub is_failed: bool,
    pub is_created: bool,
    /// Never reached the API (timed-out chunk, job result missing the row)
    pub is_unprocessed: bool,
    pub error_message: Option<String>,
}

impl CrudOutcome {
    /// Successful write
    pub fn success(
        item: EngineRecord,
        id: Option<String>,
        created: bool,
        update_record_id: bool,
    ) -> Self {
        let mut record = item.record;
        if update_record_id {
            if let Some(id) = &id {
                record.set_id(id.clone());
            }
        }
        CrudOutcome {
            handle: item.handle,
            record,
            id,
            is_failed: false,
            is_created: created,
            is_unprocessed: false,
            error_message: None,
        }
    }

    /// Record rejected by the API
    pub fn failed(item: EngineRecord, message: impl Into<String>) -> Self {
        CrudOutcome {
            id: item.record.id(),
            handle: item.handle,
            record: item.record,
            is_failed: true,
            is_created: false,
            is_unprocessed: false,
            error_message: Some(message.into()),
        }
    }

    /// Record never processed; also counts as failed
    pub fn unprocessed(item: EngineRecord, message: impl Into<String>) -> Self {
        CrudOutcome {
            is_unprocessed: true,
            ..CrudOutcome::failed(item, message)
        }
    }

    /// Map a positional API result onto its record
    pub fn from_result(item: EngineRecord, result: RecordResult, update_record_id: bool) -> Self {
        if result.success {
            let id = result.id.or_else(|| item.record.id());
            CrudOutcome::success(item, id, result.created, update_record_id)
        } else {
            CrudOutcome::failed(
                item,
                result.error.unwrap_or_else(|| "Unknown error".to_string()),
            )
        }
    }
}

/// Per-call engine options
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Write created Ids onto the returned record copies
    pub update_record_id: bool,
    pub all_or_none: bool,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    /// Records per REST call, Bulk v1 batch or Bulk v2 job
    pub chunk_size: usize,
    /// Chunks in flight at once
    pub parallelism: usize,
}

impl EngineOptions {
    /// Options for an engine kind derived from the run's settings
    pub fn for_kind(kind: EngineKind, settings: &ExecutionSettings) -> Self {
        let (chunk_size, parallelism) = match kind {
            EngineKind::Rest => (settings.rest_batch_size, settings.parallel_rest_jobs),
            EngineKind::BulkV1 => (settings.bulk_v1_batch_size, settings.parallel_bulk_jobs),
            EngineKind::BulkV2 => (settings.bulk_v2_chunk_size, settings.parallel_bulk_jobs),
            EngineKind::Simulation => (usize::MAX, 1),
        };
        EngineOptions {
            update_record_id: settings.update_record_id,
            all_or_none: settings.all_or_none,
            poll_interval: settings.poll_interval,
            poll_timeout: settings.poll_timeout,
            chunk_size: chunk_size.max(1),
            parallelism: parallelism.max(1),
        }
    }
}

/// Counters shared by an engine's chunks
#[derive(Debug, Default)]
pub struct EngineStats {
    chunks: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatsSnapshot {
    pub chunks: usize,
    pub processed: usize,
    pub failed: usize,
}

impl EngineStats {
    pub fn record_chunk(&self, outcomes: &[CrudOutcome]) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(outcomes.len(), Ordering::Relaxed);
        self.failed
            .fetch_add(outcomes.iter().filter(|o| o.is_failed).count(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            chunks: self.chunks.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every engine kind
pub struct EngineBase {
    pub connection: Arc<dyn OrgConnection>,
    pub entity: String,
    pub kind: EngineKind,
    pub stats: EngineStats,
}

impl EngineBase {
    pub fn new(connection: Arc<dyn OrgConnection>, entity: impl Into<String>, kind: EngineKind) -> Self {
        EngineBase {
            connection,
            entity: entity.into(),
            kind,
            stats: EngineStats::default(),
        }
    }

    fn capability_error(&self) -> MigrationError {
        MigrationError::Capability {
            engine: self.kind.label().to_string(),
            connection: self.connection.name().to_string(),
            entity: self.entity.clone(),
        }
    }

    pub fn rest(&self) -> Result<&dyn RestApi> {
        self.connection.rest().ok_or_else(|| self.capability_error())
    }

    pub fn bulk_v1(&self) -> Result<&dyn BulkV1Api> {
        self.connection.bulk_v1().ok_or_else(|| self.capability_error())
    }

    pub fn bulk_v2(&self) -> Result<&dyn BulkV2Api> {
        self.connection.bulk_v2().ok_or_else(|| self.capability_error())
    }
}

/// CRUD contract shared by all engines
#[async_trait]
pub trait ApiEngine: Send + Sync {
    fn base(&self) -> &EngineBase;

    fn kind(&self) -> EngineKind {
        self.base().kind
    }

    fn entity_name(&self) -> &str {
        &self.base().entity
    }

    fn stats(&self) -> EngineStatsSnapshot {
        self.base().stats.snapshot()
    }

    /// Write the records and return one outcome per record
    ///
    /// Record-level API failures are reported on the outcomes. An `Err` means
    /// the whole call failed (capability, job failure, transport).
    async fn execute_crud(
        &self,
        records: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>>;
}

/// Build the engine for a kind
pub fn create_engine(
    kind: EngineKind,
    connection: Arc<dyn OrgConnection>,
    entity: &str,
) -> Box<dyn ApiEngine> {
    let base = EngineBase::new(connection, entity, kind);
    match kind {
        EngineKind::Rest => Box::new(RestEngine::new(base)),
        EngineKind::BulkV1 => Box::new(BulkV1Engine::new(base)),
        EngineKind::BulkV2 => Box::new(BulkV2Engine::new(base)),
        EngineKind::Simulation => Box::new(SimulationEngine::new(base)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_engine_kind() {
        let settings = ExecutionSettings::default();
        assert_eq!(
            EngineKind::select(ApiMode::Auto, 199, ApiOperation::Insert, &settings),
            EngineKind::Rest
        );
        assert_eq!(
            EngineKind::select(ApiMode::Auto, 200, ApiOperation::Insert, &settings),
            EngineKind::BulkV2
        );
        assert_eq!(
            EngineKind::select(ApiMode::Auto, 5, ApiOperation::HardDelete, &settings),
            EngineKind::BulkV2
        );
        assert_eq!(
            EngineKind::select(ApiMode::BulkV1, 1, ApiOperation::Update, &settings),
            EngineKind::BulkV1
        );

        let v1 = ExecutionSettings::builder()
            .bulk_api(BulkApiVersion::V1)
            .build();
        assert_eq!(
            EngineKind::select(ApiMode::Auto, 1000, ApiOperation::Insert, &v1),
            EngineKind::BulkV1
        );

        let simulated = ExecutionSettings::builder().simulation(true).build();
        assert_eq!(
            EngineKind::select(ApiMode::Rest, 1, ApiOperation::Insert, &simulated),
            EngineKind::Simulation
        );
    }

    #[test]
    fn test_options_for_kind() {
        let settings = ExecutionSettings::builder().parallel_bulk_jobs(3).build();
        let v1 = EngineOptions::for_kind(EngineKind::BulkV1, &settings);
        assert_eq!(v1.chunk_size, 9_500);
        assert_eq!(v1.parallelism, 3);
        assert!(v1.update_record_id);
        let rest = EngineOptions::for_kind(EngineKind::Rest, &settings);
        assert_eq!(rest.chunk_size, 200);
        assert_eq!(rest.parallelism, 1);

        let keep_records = ExecutionSettings::builder().update_record_id(false).build();
        let v2 = EngineOptions::for_kind(EngineKind::BulkV2, &keep_records);
        assert!(!v2.update_record_id);
    }

    #[test]
    fn test_outcome_from_result() {
        let item = EngineRecord::new(RecordHandle::source(4), Record::new().with("Name", "A"));
        let ok = CrudOutcome::from_result(item.clone(), RecordResult::ok("001A", true), true);
        assert_eq!(ok.record.id().as_deref(), Some("001A"));
        assert!(ok.is_created && !ok.is_failed);
        assert_eq!(ok.handle, RecordHandle::source(4));

        let untouched = CrudOutcome::from_result(item.clone(), RecordResult::ok("001A", true), false);
        assert!(untouched.record.id().is_none());
        assert_eq!(untouched.id.as_deref(), Some("001A"));

        let failed = CrudOutcome::from_result(item.clone(), RecordResult::failed("bad"), true);
        assert!(failed.is_failed);
        assert_eq!(failed.error_message.as_deref(), Some("bad"));

        let skipped = CrudOutcome::unprocessed(item, "timeout");
        assert!(skipped.is_failed && skipped.is_unprocessed);
    }
}
