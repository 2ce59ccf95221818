//! ProcessSource: read source records, fill in what CSV files leave out and
//! apply value transforms

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use super::{JobStage, MigrationJob};
use crate::config::CompositeFeedConfig;
use crate::error::{MigrationError, Result};
use crate::model::{ID_FIELD, KEY_SEPARATOR, Record, value_to_string};
use crate::remote::Endpoint;
use crate::task::apply_transforms;

/// Source data problem found while reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceIssue {
    MissingSourceFile { entity: String, path: PathBuf },
    MissingColumn { entity: String, field: String },
}

impl fmt::Display for SourceIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceIssue::MissingSourceFile { entity, path } => {
                write!(f, "{}: source file {} not found", entity, path.display())
            }
            SourceIssue::MissingColumn { entity, field } => {
                write!(f, "{}: column '{}' missing from the source file", entity, field)
            }
        }
    }
}

/// Stable Id for a CSV row without one
///
/// Three characters of the entity name, then the 1-based row number.
pub fn synthetic_id(entity: &str, row: usize) -> String {
    let prefix: String = entity
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .to_uppercase();
    format!("{}{:015}", prefix, row + 1)
}

/// Split `A;B;C` (or `Rel.A;B;C`) columns into their component columns
///
/// Components already present on the record are left alone.
fn expand_composite_columns(record: &mut Record) {
    let composite: Vec<String> = record
        .field_names()
        .filter(|f| f.contains(KEY_SEPARATOR))
        .cloned()
        .collect();

    for column in composite {
        let Some(value) = record.remove(&column) else {
            continue;
        };
        let text = value_to_string(&value).unwrap_or_default();
        let mut values = text.split(KEY_SEPARATOR).map(str::trim);

        let mut names = column.split(KEY_SEPARATOR).map(str::trim);
        let first = names.next().unwrap_or_default();
        let prefix = first.rfind('.').map(|i| &first[..=i]).unwrap_or("");

        let fields = std::iter::once(first.to_string()).chain(names.map(|n| {
            if n.contains('.') {
                n.to_string()
            } else {
                format!("{}{}", prefix, n)
            }
        }));
        for field in fields {
            let part = values.next().filter(|v| !v.is_empty());
            if record.contains(&field) {
                continue;
            }
            record.set(
                field,
                part.map(|p| Value::String(p.to_string())).unwrap_or(Value::Null),
            );
        }
    }
}

/// Whether the record carries a usable Id
fn has_id(record: &Record) -> bool {
    record.id().is_some_and(|id| !id.trim().is_empty())
}

impl MigrationJob {
    pub(super) async fn process_source(&mut self) -> Result<()> {
        self.enter(JobStage::ProcessSource);
        self.cancel.check()?;

        let mut feed = match self.set.composite_feed.clone() {
            Some(config) => self.read_composite_feed(&config).await?,
            None => HashMap::new(),
        };

        for index in 0..self.tasks.len() {
            self.cancel.check()?;
            let name = self.tasks[index].name().to_string();
            let from_feed = feed.remove(&name);
            let mut records = match self.read_source(index).await? {
                Some(records) => records,
                None => {
                    if from_feed.is_none() {
                        self.missing_source_file(index)?;
                    }
                    Vec::new()
                }
            };
            if let Some(rows) = from_feed {
                debug!("{}: {} rows from the composite feed", name, rows.len());
                records.extend(rows);
            }

            if !self.source.is_org() {
                let mut synthesized = 0;
                for (row, record) in records.iter_mut().enumerate() {
                    expand_composite_columns(record);
                    if !has_id(record) {
                        record.set_id(synthetic_id(&name, row));
                        synthesized += 1;
                    }
                }
                if synthesized > 0 {
                    debug!("{}: synthesized {} record Ids", name, synthesized);
                }
                self.check_columns(index, &records)?;
            }

            info!("{}: {} source records", name, records.len());
            self.tasks[index].load_source(records);
        }

        for entity in feed.keys() {
            warn!(
                "Composite feed rows for {} ignored; it is not part of object-set '{}'",
                entity, self.set.name
            );
        }

        self.apply_source_transforms()
    }

    /// Source records of a task, `None` when its file does not exist
    async fn read_source(&mut self, index: usize) -> Result<Option<Vec<Record>>> {
        let task = &self.tasks[index];
        let (path, store) = match &self.source {
            Endpoint::Org(connection) => {
                let soql = task.descriptor.query.to_soql();
                debug!("{}: {}", task.name(), soql);
                return connection.query(&soql).await.map(Some);
            }
            Endpoint::Files { directory, store } => (
                directory.join(format!("{}.csv", task.name())),
                Arc::clone(store),
            ),
        };

        Ok(self
            .cache
            .read(store.as_ref(), &path)
            .await?
            .map(|records| records.as_ref().clone()))
    }

    fn missing_source_file(&mut self, index: usize) -> Result<()> {
        let task = &self.tasks[index];
        if task.descriptor.is_auto_added {
            debug!("{}: no source file; auto-added object stays empty", task.name());
            return Ok(());
        }
        let issue = SourceIssue::MissingSourceFile {
            entity: task.name().to_string(),
            path: self.source.entity_file(task.name()).unwrap_or_default(),
        };
        self.record_issue(issue)
    }

    /// Declared fields the file does not have; lookups may come by key path instead
    fn check_columns(&mut self, index: usize, records: &[Record]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let descriptor = &self.tasks[index].descriptor;
        let written: Vec<&str> = descriptor
            .transforms
            .iter()
            .map(|t| t.target_field())
            .collect();
        let missing: Vec<String> = descriptor
            .query
            .direct_fields()
            .filter(|f| f.as_str() != ID_FIELD && descriptor.lookup(f).is_none())
            .filter(|f| !written.iter().any(|w| w.eq_ignore_ascii_case(f)))
            .filter(|f| !first.contains(f))
            .cloned()
            .collect();
        let entity = descriptor.name.clone();

        for field in missing {
            self.record_issue(SourceIssue::MissingColumn {
                entity: entity.clone(),
                field,
            })?;
        }
        Ok(())
    }

    fn record_issue(&mut self, issue: SourceIssue) -> Result<()> {
        if self.set.settings.validate_only {
            return Err(MigrationError::SourceValidation(issue.to_string()));
        }
        warn!("{}", issue);
        self.source_issues.push(issue);
        Ok(())
    }

    /// Rows of the composite feed file grouped by their entity column
    async fn read_composite_feed(
        &mut self,
        config: &CompositeFeedConfig,
    ) -> Result<HashMap<String, Vec<Record>>> {
        let (path, store) = match &self.source {
            Endpoint::Files { directory, store } => {
                (directory.join(&config.file), Arc::clone(store))
            }
            Endpoint::Org(_) => {
                warn!(
                    "Composite feed {} ignored; the source is {}",
                    config.file,
                    self.source.label()
                );
                return Ok(HashMap::new());
            }
        };

        let Some(rows) = self.cache.read(store.as_ref(), &path).await? else {
            return Err(MigrationError::configuration(format!(
                "Composite feed {} not found",
                path.display()
            )));
        };

        let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
        for row in rows.iter() {
            let mut record = row.clone();
            let Some(entity) = record
                .remove(&config.entity_column)
                .and_then(|v| value_to_string(&v))
                .filter(|e| !e.trim().is_empty())
            else {
                debug!("Composite feed row without {}; skipped", config.entity_column);
                continue;
            };
            grouped
                .entry(entity.trim().to_string())
                .or_default()
                .push(record);
        }
        info!(
            "Composite feed {}: {} rows for {} objects",
            config.file,
            rows.len(),
            grouped.len()
        );
        Ok(grouped)
    }

    /// Apply each task's transforms; `LookupCopy` reads other tasks' sources
    fn apply_source_transforms(&mut self) -> Result<()> {
        for index in 0..self.tasks.len() {
            if self.tasks[index].descriptor.transforms.is_empty() {
                continue;
            }
            let name = self.tasks[index].name().to_string();
            let transforms = self.tasks[index].descriptor.transforms.clone();
            let mut records = std::mem::take(&mut self.tasks[index].source);

            let tasks = &self.tasks;
            let parents = |entity: &str| {
                tasks
                    .iter()
                    .find(|t| t.name() == entity)
                    .map(|t| &t.source)
            };
            let applied = apply_transforms(&name, &transforms, &mut records, &parents);

            self.tasks[index].source = records;
            applied?;
            self.tasks[index].rebuild_source_index();
        }
        Ok(())
    }
}
