//! Bulk API v1 engine
//!
//! Each chunk gets its own job holding a single batch. Batches are polled at a
//! fixed interval until `Completed` or `Failed`; results come back in upload
//! order and are matched to records by position. The server-side processed
//! and failed counts of every batch are summed per call.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use log::{debug, info, warn};

use super::{
    ApiEngine, CrudOutcome, EngineBase, EngineOptions, EngineRecord, poll_until, run_chunks,
};
use crate::error::{MigrationError, Result};
use crate::model::{ApiOperation, Record};
use crate::remote::{BatchInfo, BatchState, BulkV1Api};

/// Server-reported counts summed over the batches of one call
#[derive(Debug, Default)]
struct BatchTotals {
    processed: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchTotals {
    fn add(&self, info: &BatchInfo) {
        self.processed.fetch_add(info.processed, Ordering::Relaxed);
        self.failed.fetch_add(info.failed, Ordering::Relaxed);
    }
}

pub struct BulkV1Engine {
    base: EngineBase,
}

impl BulkV1Engine {
    pub fn new(base: EngineBase) -> Self {
        BulkV1Engine { base }
    }

    /// Create a job for the chunk, run its batch, then close the job
    ///
    /// A rejected close is logged; the batch outcomes stand.
    async fn run_job(
        &self,
        api: &dyn BulkV1Api,
        chunk: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
        totals: &BatchTotals,
    ) -> Result<Vec<CrudOutcome>> {
        let job_id = api.create_job(&self.base.entity, operation).await?;
        let outcome = self
            .run_batch(api, &job_id, chunk, operation, options, totals)
            .await;
        if let Err(err) = api.close_job(&job_id).await {
            warn!("{}: failed to close job {}: {}", self.base.entity, job_id, err);
        }
        outcome
    }

    async fn run_batch(
        &self,
        api: &dyn BulkV1Api,
        job_id: &str,
        chunk: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
        totals: &BatchTotals,
    ) -> Result<Vec<CrudOutcome>> {
        let payload: Vec<Record> = chunk.iter().map(|item| item.record.clone()).collect();
        let batch_id = api.add_batch(job_id, &payload).await?;
        debug!("{}: batch {} added to job {}", self.base.entity, batch_id, job_id);

        let batch = batch_id.as_str();
        let info: BatchInfo = poll_until(
            options.poll_interval,
            options.poll_timeout,
            &self.base.entity,
            batch,
            || async move {
                let info = api.batch_status(job_id, batch).await?;
                Ok(info.state.is_terminal().then_some(info))
            },
        )
        .await?;
        totals.add(&info);

        match info.state {
            BatchState::Failed => Err(MigrationError::job_failed(
                &self.base.entity,
                operation.api_name(),
                info.message
                    .unwrap_or_else(|| format!("batch {} failed", batch_id)),
            )),
            BatchState::NotProcessed => Ok(chunk
                .into_iter()
                .map(|item| CrudOutcome::unprocessed(item, "Batch was not processed"))
                .collect()),
            _ => {
                let mut results = api.batch_results(job_id, &batch_id).await?.into_iter();
                Ok(chunk
                    .into_iter()
                    .map(|item| match results.next() {
                        Some(result) => {
                            CrudOutcome::from_result(item, result, options.update_record_id)
                        }
                        None => CrudOutcome::unprocessed(item, "No result returned for record"),
                    })
                    .collect())
            }
        }
    }
}

#[async_trait]
impl ApiEngine for BulkV1Engine {
    fn base(&self) -> &EngineBase {
        &self.base
    }

    async fn execute_crud(
        &self,
        records: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>> {
        let api = self.base.bulk_v1()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "{}: Bulk v1 {} of {} records in batches of {}",
            self.base.entity,
            operation,
            records.len(),
            options.chunk_size
        );
        let totals = BatchTotals::default();
        let outcome = run_chunks(&self.base, records, options, |_, chunk| {
            self.run_job(api, chunk, operation, options, &totals)
        })
        .await;
        info!(
            "{}: Bulk v1 batches reported {} processed, {} failed",
            self.base.entity,
            totals.processed.load(Ordering::Relaxed),
            totals.failed.load(Ordering::Relaxed)
        );
        outcome
    }
}
