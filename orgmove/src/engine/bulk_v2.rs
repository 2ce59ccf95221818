//! Bulk API v2 engine
//!
//! One ingest job per chunk: create, upload, close, poll until
//! `JobComplete` / `Failed` / `Aborted`, then fetch the successful, failed and
//! unprocessed result sets. Result rows are not guaranteed to be in upload
//! order, so they are reconciled by Id when every uploaded record has one and
//! by whole-record hash otherwise.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use log::{debug, warn};

use super::{
    ApiEngine, CrudOutcome, EngineBase, EngineOptions, EngineRecord, poll_until, run_chunks,
};
use crate::error::{MigrationError, Result};
use crate::model::{ApiOperation, ID_FIELD, Record, record_hash};
use crate::remote::{BulkV2Api, JobInfo, JobState, ResultSet};

const RESULT_ID: &str = "sf__Id";
const RESULT_CREATED: &str = "sf__Created";
const RESULT_ERROR: &str = "sf__Error";
const NOT_IN_RESULTS: &str = "Record not found in job results";

/// The three result sets of a finished job
#[derive(Debug, Default)]
pub(crate) struct JobResults {
    pub successful: Vec<Record>,
    pub failed: Vec<Record>,
    pub unprocessed: Vec<Record>,
}

pub struct BulkV2Engine {
    base: EngineBase,
}

impl BulkV2Engine {
    pub fn new(base: EngineBase) -> Self {
        BulkV2Engine { base }
    }

    async fn run_job(
        &self,
        api: &dyn BulkV2Api,
        chunk: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>> {
        let entity = self.base.entity.as_str();
        let job_id = api.create_job(entity, operation).await?;
        let payload: Vec<Record> = chunk.iter().map(|item| item.record.clone()).collect();
        api.upload(&job_id, &payload).await?;
        api.close_job(&job_id).await?;
        debug!("{}: Bulk v2 job {} uploaded {} records", entity, job_id, payload.len());

        let job = job_id.as_str();
        let info: JobInfo = poll_until(
            options.poll_interval,
            options.poll_timeout,
            entity,
            job,
            || async move {
                let info = api.job_status(job).await?;
                Ok(info.state.is_terminal().then_some(info))
            },
        )
        .await?;

        if matches!(info.state, JobState::Failed | JobState::Aborted) {
            return Err(MigrationError::job_failed(
                entity,
                operation.api_name(),
                info.message
                    .unwrap_or_else(|| format!("job {} ended in state {}", job_id, info.state)),
            ));
        }

        let results = JobResults {
            successful: api.results(&job_id, ResultSet::Successful).await?,
            failed: api.results(&job_id, ResultSet::Failed).await?,
            unprocessed: api.results(&job_id, ResultSet::Unprocessed).await?,
        };
        if !results.unprocessed.is_empty() {
            warn!(
                "{}: job {} left {} records unprocessed",
                entity,
                job_id,
                results.unprocessed.len()
            );
        }
        let outcomes = reconcile(chunk, results, options.update_record_id);

        let unmatched = outcomes
            .iter()
            .filter(|o| o.is_unprocessed && o.error_message.as_deref() == Some(NOT_IN_RESULTS))
            .count();
        if unmatched > 0 {
            warn!("{}: {} records missing from job {} results", entity, unmatched, job_id);
        }
        Ok(outcomes)
    }
}

/// Pair result rows with the uploaded records
///
/// By Id when every record carries one (`Id` column, else `sf__Id`); by hash
/// of the comparable fields otherwise, taking the first unclaimed record with
/// an equal hash. Records listed in the unprocessed set, or claimed by no
/// row at all, come back unprocessed.
pub(crate) fn reconcile(
    chunk: Vec<EngineRecord>,
    results: JobResults,
    update_record_id: bool,
) -> Vec<CrudOutcome> {
    let rows = results
        .successful
        .into_iter()
        .map(|row| (row, ResultSet::Successful))
        .chain(results.failed.into_iter().map(|row| (row, ResultSet::Failed)))
        .chain(
            results
                .unprocessed
                .into_iter()
                .map(|row| (row, ResultSet::Unprocessed)),
        );

    let mut claimed: Vec<Option<(Record, ResultSet)>> = vec![None; chunk.len()];
    let by_id = !chunk.is_empty() && chunk.iter().all(|item| item.record.id().is_some());

    if by_id {
        let positions: HashMap<String, usize> = chunk
            .iter()
            .enumerate()
            .filter_map(|(pos, item)| item.record.id().map(|id| (id, pos)))
            .collect();
        for (row, set) in rows {
            let id = row.get_str(ID_FIELD).or_else(|| row.get_str(RESULT_ID));
            if let Some(pos) = id.and_then(|id| positions.get(&id).copied()) {
                if claimed[pos].is_none() {
                    claimed[pos] = Some((row, set));
                }
            }
        }
    } else {
        let mut positions: HashMap<u64, VecDeque<usize>> = HashMap::new();
        for (pos, item) in chunk.iter().enumerate() {
            positions
                .entry(record_hash(&item.record, &[]))
                .or_default()
                .push_back(pos);
        }
        for (row, set) in rows {
            if let Some(pos) = positions
                .get_mut(&record_hash(&row, &[]))
                .and_then(|queue| queue.pop_front())
            {
                claimed[pos] = Some((row, set));
            }
        }
    }

    chunk
        .into_iter()
        .zip(claimed)
        .map(|(item, row)| match row {
            Some((row, ResultSet::Successful)) => {
                let id = row.get_str(RESULT_ID).or_else(|| item.record.id());
                let created = row
                    .get_str(RESULT_CREATED)
                    .is_some_and(|c| c.eq_ignore_ascii_case("true"));
                CrudOutcome::success(item, id, created, update_record_id)
            }
            Some((row, ResultSet::Failed)) => CrudOutcome::failed(
                item,
                row.get_str(RESULT_ERROR)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            Some((_, ResultSet::Unprocessed)) => {
                CrudOutcome::unprocessed(item, "Not processed by the job")
            }
            None => CrudOutcome::unprocessed(item, NOT_IN_RESULTS),
        })
        .collect()
}

#[async_trait]
impl ApiEngine for BulkV2Engine {
    fn base(&self) -> &EngineBase {
        &self.base
    }

    async fn execute_crud(
        &self,
        records: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>> {
        let api = self.base.bulk_v2()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        run_chunks(&self.base, records, options, |_, chunk| {
            self.run_job(api, chunk, operation, options)
        })
        .await
    }
}
