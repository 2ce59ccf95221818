//! Prepare: read the target records each task needs and pair them with the
//! source

use std::sync::Arc;

use log::{debug, info};

use super::{JobStage, MigrationJob};
use crate::error::Result;
use crate::model::Record;
use crate::remote::Endpoint;

impl MigrationJob {
    pub(super) async fn prepare(&mut self) -> Result<()> {
        self.enter(JobStage::Prepare);
        self.cancel.check()?;

        for index in 0..self.tasks.len() {
            self.cancel.check()?;
            // A CSV target is rewritten whole, so its current content always matters
            if self.target.is_org() && !self.tasks[index].needs_target_records() {
                debug!("{}: target records not needed", self.tasks[index].name());
                continue;
            }

            let records = self.read_target(index).await?;
            let task = &mut self.tasks[index];
            task.load_target(records);
            let stats = task.reconcile();
            info!(
                "{}: {} source, {} target, {} matched ({} by key, {} by hash), {} new",
                task.name(),
                task.source.len(),
                task.target.len(),
                stats.matched(),
                stats.matched_by_key,
                stats.matched_by_hash,
                stats.unmatched
            );
        }
        Ok(())
    }

    async fn read_target(&mut self, index: usize) -> Result<Vec<Record>> {
        let task = &self.tasks[index];
        match &self.target {
            Endpoint::Org(connection) => {
                let soql = task.target_query().to_soql();
                debug!("{}: {}", task.name(), soql);
                connection.query(&soql).await
            }
            Endpoint::Files { directory, store } => {
                let path = directory.join(format!("{}.csv", task.descriptor.target_entity()));
                let store = Arc::clone(store);
                Ok(self
                    .cache
                    .read(store.as_ref(), &path)
                    .await?
                    .map(|records| records.as_ref().clone())
                    .unwrap_or_default())
            }
        }
    }
}
