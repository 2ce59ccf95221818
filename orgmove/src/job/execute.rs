//! Execute: purge pass, main pass in dependency order, deferred lookups

use std::sync::Arc;

use log::{debug, info, warn};

use super::{JobStage, MigrationJob};
use crate::engine::{
    CrudOutcome, EngineKind, EngineOptions, EngineRecord, create_engine, simulated_id,
};
use crate::error::{MigrationError, Result};
use crate::model::{ApiOperation, CrudOperation, Record};
use crate::remote::Endpoint;
use crate::task::{MigrationTask, ParentIndex, PlannedWrite};

/// Outcomes for a CSV target: every record succeeds, inserts keep the source
/// Id (or get a synthesized one)
fn local_outcomes(
    task: &MigrationTask,
    operation: ApiOperation,
    records: Vec<EngineRecord>,
) -> Vec<CrudOutcome> {
    records
        .into_iter()
        .map(|item| match operation {
            ApiOperation::Insert => {
                let id = item
                    .handle
                    .source
                    .and_then(|s| task.source.get(s))
                    .and_then(|r| r.id())
                    .unwrap_or_else(|| simulated_id(task.descriptor.target_entity()));
                CrudOutcome::success(item, Some(id), true, true)
            }
            _ => {
                let id = item.record.id();
                CrudOutcome::success(item, id, false, true)
            }
        })
        .collect()
}

impl MigrationJob {
    pub(super) async fn execute(&mut self) -> Result<()> {
        self.enter(JobStage::Execute);
        self.cancel.check()?;
        let policy = self.set.settings.missing_parent_policy;

        self.purge_pass().await?;

        for index in 0..self.tasks.len() {
            self.cancel.check()?;
            self.tasks[index].prepare_payloads(&self.lookups, policy)?;
            for write in self.tasks[index].plan_writes() {
                self.run_write(index, write).await?;
            }
            self.lookups
                .complete(ParentIndex::from_task(&self.tasks[index]));
            self.write_target_file(index).await?;

            let task = &self.tasks[index];
            info!(
                "{}: {} inserted, {} updated, {} deleted, {} unchanged, {} failed",
                task.name(),
                task.counts.inserted,
                task.counts.updated,
                task.counts.deleted,
                task.counts.unchanged,
                task.counts.failed
            );
        }

        self.deferred_pass().await
    }

    /// Delete old target data, children before parents
    async fn purge_pass(&mut self) -> Result<()> {
        let order = match &self.schedule {
            Some(schedule) => schedule.delete_order(),
            None => return Ok(()),
        };
        for name in order {
            let Some(index) = self.task_index(&name) else {
                continue;
            };
            let Some(write) = self.tasks[index].plan_purge() else {
                continue;
            };
            self.cancel.check()?;
            info!("{}: deleting {} target records", name, write.len());
            self.run_write(index, write).await?;

            let task = &mut self.tasks[index];
            if task.descriptor.delete_old_data {
                task.reconcile();
            }
        }
        Ok(())
    }

    /// Fill in lookups whose parents were not written yet in the main pass
    async fn deferred_pass(&mut self) -> Result<()> {
        let policy = self.set.settings.missing_parent_policy;
        for index in 0..self.tasks.len() {
            if !self.tasks[index].has_deferred() {
                continue;
            }
            self.cancel.check()?;
            let Some(write) = self.tasks[index].plan_deferred(&self.lookups, policy)? else {
                continue;
            };
            info!(
                "{}: filling in {} deferred lookups",
                self.tasks[index].name(),
                write.len()
            );
            self.run_write(index, write).await?;
            self.write_target_file(index).await?;
        }
        Ok(())
    }

    /// Send one planned write and apply its outcomes
    async fn run_write(&mut self, index: usize, write: PlannedWrite) -> Result<()> {
        let task = &self.tasks[index];
        let operation = write.operation;
        let on_source = task.descriptor.operation == CrudOperation::DeleteSource;
        let endpoint = if on_source { &self.source } else { &self.target };
        let settings = &self.set.settings;

        let (kind, result) = match endpoint {
            Endpoint::Files { .. } => {
                debug!(
                    "{}: {} of {} records into {}",
                    task.name(),
                    operation,
                    write.len(),
                    endpoint.label()
                );
                (None, Ok(local_outcomes(task, operation, write.records)))
            }
            Endpoint::Org(connection) => {
                let kind =
                    EngineKind::select(task.descriptor.api_mode, write.len(), operation, settings);
                let entity = if on_source {
                    task.descriptor.name.as_str()
                } else {
                    task.descriptor.target_entity()
                };
                info!(
                    "{}: {} of {} records via {}",
                    task.name(),
                    operation,
                    write.len(),
                    kind
                );
                let engine = create_engine(kind, Arc::clone(connection), entity);
                let options = EngineOptions::for_kind(kind, settings);
                let result = engine
                    .execute_crud(write.records, operation, &options)
                    .await;
                (Some(kind), result)
            }
        };

        // Chunks written before a failure still get their Ids recorded
        let (outcomes, failure) = match result {
            Ok(outcomes) => (outcomes, None),
            Err(err @ MigrationError::PartialWrite { .. }) => {
                let (cause, outcomes) = err.into_parts();
                (outcomes, Some(cause))
            }
            Err(err) => return Err(err),
        };

        let task = &mut self.tasks[index];
        if kind.is_some() {
            task.engine = kind;
        }
        task.apply_outcomes(operation, outcomes);
        match failure {
            Some(cause) => {
                warn!(
                    "{}: {} inserted, {} updated before the write failed",
                    task.name(),
                    task.counts.inserted,
                    task.counts.updated
                );
                Err(cause)
            }
            None => Ok(()),
        }
    }

    /// Rewrite a CSV target's file with the task's current target records
    async fn write_target_file(&mut self, index: usize) -> Result<()> {
        let task = &self.tasks[index];
        let writes = !matches!(
            task.descriptor.operation,
            CrudOperation::Readonly | CrudOperation::DeleteSource
        ) || task.descriptor.delete_old_data;
        if !writes || self.set.settings.simulation {
            return Ok(());
        }
        let (path, store) = match &self.target {
            Endpoint::Files { directory, store } => (
                directory.join(format!("{}.csv", task.descriptor.target_entity())),
                Arc::clone(store),
            ),
            Endpoint::Org(_) => return Ok(()),
        };

        let records: Vec<Record> = task.target.iter().map(|(_, r)| r.clone()).collect();
        debug!("{}: writing {} records to {}", task.name(), records.len(), path.display());
        self.cache.write(store.as_ref(), &path, records).await
    }
}
