//! Addon hooks run around the Execute stage
//!
//! Addons observe the prepared tasks and may abort the run. How addons are
//! discovered or loaded is up to the caller; the job only invokes the ones it
//! was given, in registration order.

use async_trait::async_trait;
use log::{info, warn};
use uuid::Uuid;

use crate::config::ExecutionSettings;
use crate::error::Result;
use crate::model::CrudOperation;
use crate::task::MigrationTask;

/// When an addon is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonEvent {
    BeforeExecute,
    AfterExecute,
}

impl AddonEvent {
    pub fn label(&self) -> &'static str {
        match self {
            AddonEvent::BeforeExecute => "before execute",
            AddonEvent::AfterExecute => "after execute",
        }
    }
}

/// What the job does after an addon returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddonAction {
    Continue,
    /// Stop the run with this reason
    Abort(String),
}

/// Read-only view handed to addons
pub struct AddonContext<'a> {
    pub job_id: Uuid,
    /// Correlates the log lines of one addon call
    pub invocation_id: Uuid,
    pub object_set: &'a str,
    pub settings: &'a ExecutionSettings,
    pub tasks: &'a [MigrationTask],
}

#[async_trait]
pub trait AddonHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: AddonEvent, context: &AddonContext<'_>)
    -> Result<AddonAction>;
}

/// Aborts before Execute when more records would be written than allowed
pub struct RecordLimitAddon {
    limit: usize,
}

impl RecordLimitAddon {
    pub fn new(limit: usize) -> Self {
        RecordLimitAddon { limit }
    }

    /// Upper bound of records the main pass writes
    pub fn planned_writes(tasks: &[MigrationTask]) -> usize {
        tasks
            .iter()
            .map(|task| match task.descriptor.operation {
                CrudOperation::Readonly => 0,
                CrudOperation::Insert | CrudOperation::Upsert | CrudOperation::DeleteSource => {
                    task.source.len()
                }
                CrudOperation::Update
                | CrudOperation::Delete
                | CrudOperation::HardDelete
                | CrudOperation::DeleteHierarchy => task.source_to_target().len(),
            })
            .sum()
    }
}

#[async_trait]
impl AddonHook for RecordLimitAddon {
    fn name(&self) -> &str {
        "record-limit"
    }

    async fn on_event(
        &self,
        event: AddonEvent,
        context: &AddonContext<'_>,
    ) -> Result<AddonAction> {
        if event != AddonEvent::BeforeExecute {
            return Ok(AddonAction::Continue);
        }
        let planned = Self::planned_writes(context.tasks);
        if planned > self.limit {
            warn!(
                "[{}] {} records planned in '{}', limit is {}",
                context.invocation_id, planned, context.object_set, self.limit
            );
            return Ok(AddonAction::Abort(format!(
                "{} records planned, limit is {}",
                planned, self.limit
            )));
        }
        info!(
            "[{}] {} records planned in '{}' (limit {})",
            context.invocation_id, planned, context.object_set, self.limit
        );
        Ok(AddonAction::Continue)
    }
}
