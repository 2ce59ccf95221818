//! Job report: per-entity outcomes, counts and issues of one object-set run

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::source::SourceIssue;
use super::StageRecord;
use crate::error::Result;
use crate::task::{MigrationTask, MissingParentEntry, TaskCounts};

/// One record's write result
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeEntry {
    pub source_id: Option<String>,
    pub target_id: Option<String>,
    pub created: bool,
    pub failed: bool,
    pub unprocessed: bool,
    pub error: Option<String>,
}

/// Results of one entity
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity: String,
    pub target_entity: String,
    pub operation: String,
    pub engine: Option<String>,
    pub auto_added: bool,
    pub counts: TaskCounts,
    pub outcomes: Vec<OutcomeEntry>,
}

impl EntityReport {
    pub fn from_task(task: &MigrationTask) -> Self {
        let outcomes = task
            .outcomes
            .iter()
            .map(|o| OutcomeEntry {
                source_id: o
                    .handle
                    .source
                    .and_then(|s| task.source.get(s))
                    .and_then(|r| r.id()),
                target_id: o.id.clone(),
                created: o.is_created,
                failed: o.is_failed,
                unprocessed: o.is_unprocessed,
                error: o.error_message.clone(),
            })
            .collect();

        EntityReport {
            entity: task.descriptor.name.clone(),
            target_entity: task.descriptor.target_entity().to_string(),
            operation: task.descriptor.operation.to_string(),
            engine: task.engine.map(|k| k.label().to_string()),
            auto_added: task.descriptor.is_auto_added,
            counts: task.counts,
            outcomes,
        }
    }
}

/// Output of one object-set run
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub object_set: String,
    pub source: String,
    pub target: String,
    pub simulation: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Execution order
    pub entities: Vec<EntityReport>,
    pub missing_parents: Vec<MissingParentEntry>,
    pub source_issues: Vec<SourceIssue>,
    pub stage_history: Vec<StageRecord>,
}

impl JobReport {
    /// Counts summed over every entity
    pub fn totals(&self) -> TaskCounts {
        let mut totals = TaskCounts::default();
        for entity in &self.entities {
            totals.add(&entity.counts);
        }
        totals
    }

    pub fn entity(&self, name: &str) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.entity == name)
    }

    pub fn execution_order(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.entity.as_str()).collect()
    }

    pub fn has_failures(&self) -> bool {
        self.totals().failed > 0
    }

    /// Write the report as pretty JSON
    pub async fn write_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }
}
