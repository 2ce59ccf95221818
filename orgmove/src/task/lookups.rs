//! Lookup resolution against already-executed parent tasks
//!
//! A lookup value is resolved in two steps: the source parent Id is mapped
//! through the parent task's source→target map, then the business-key path
//! column (`Account.Name`) is looked up in the parent's target key index.
//! Parents that have not run yet (same entity, later member of a cycle)
//! yield [`Resolution::Deferred`].

use std::collections::HashMap;

use serde::Serialize;

use super::MigrationTask;
use crate::model::{ID_FIELD, LookupField, Record, external_key};

/// Identifier and business-key maps of one executed task
#[derive(Debug, Clone, Default)]
pub struct ParentIndex {
    pub entity: String,
    /// Source external-Id fields, used to build lookup path columns
    pub key_fields: Vec<String>,
    ids: HashMap<String, String>,
    keys: HashMap<String, String>,
}

impl ParentIndex {
    pub fn from_task(task: &MigrationTask) -> Self {
        let mut ids = HashMap::new();
        let mut keys = HashMap::new();

        for (key, &t) in task.target.key_index() {
            if let Some(id) = task.target.get(t).and_then(|r| r.id()) {
                keys.insert(key.clone(), id);
            }
        }
        for (&s, &t) in task.source_to_target() {
            let Some(target_id) = task.target.get(t).and_then(|r| r.id()) else {
                continue;
            };
            if let Some(source_id) = task.source.get(s).and_then(|r| r.id()) {
                ids.insert(source_id, target_id.clone());
            }
            if let Some(key) = task.source.key_of(s) {
                keys.entry(key).or_insert(target_id);
            }
        }

        ParentIndex {
            entity: task.descriptor.name.clone(),
            key_fields: task.descriptor.external_id.clone(),
            ids,
            keys,
        }
    }

    /// Target Id of the record that had this Id in the source
    pub fn by_source_id(&self, id: &str) -> Option<&str> {
        self.ids.get(id).map(|s| s.as_str())
    }

    /// Target Id of the record with this normalized business key
    pub fn by_key(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.ids.len().max(self.keys.len())
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.keys.is_empty()
    }
}

/// What lookups can see while a task is prepared
#[derive(Debug, Default)]
pub struct LookupContext {
    indexes: HashMap<String, ParentIndex>,
    /// Every scheduled entity and its external-Id fields
    scheduled: HashMap<String, Vec<String>>,
}

impl LookupContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scheduled entity before anything runs
    pub fn schedule(&mut self, entity: &str, key_fields: Vec<String>) {
        self.scheduled.insert(entity.to_string(), key_fields);
    }

    /// Publish (or refresh) an executed task's index
    pub fn complete(&mut self, index: ParentIndex) {
        self.indexes.insert(index.entity.clone(), index);
    }

    pub fn index(&self, entity: &str) -> Option<&ParentIndex> {
        self.indexes.get(entity)
    }

    /// Scheduled in this object-set but not executed yet
    pub fn is_pending(&self, entity: &str) -> bool {
        self.scheduled.contains_key(entity) && !self.indexes.contains_key(entity)
    }

    fn key_fields(&self, entity: &str) -> Option<&[String]> {
        self.indexes
            .get(entity)
            .map(|i| i.key_fields.as_slice())
            .or_else(|| self.scheduled.get(entity).map(|k| k.as_slice()))
    }
}

/// Outcome of resolving one lookup value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing to resolve (null lookup, no path value)
    Empty,
    Resolved(String),
    /// The parent runs later; retry in the deferred pass
    Deferred,
    /// No parent record matches this value
    Missing(String),
}

/// Lookup left unresolved because its parent had not run yet
#[derive(Debug, Clone)]
pub struct DeferredLookup {
    /// Source position of the child record
    pub source: usize,
    pub lookup: LookupField,
}

/// A lookup value cleared (or aborted on) for lack of a parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingParentEntry {
    pub entity: String,
    /// Business key (or Id) of the child record
    pub record: String,
    pub field: String,
    pub value: String,
    pub referenced: String,
}

/// Normalized parent key read from the child's path columns
pub fn path_key(record: &Record, relationship: &str, key_fields: &[String]) -> Option<String> {
    if key_fields.is_empty() || key_fields.iter().all(|f| f == ID_FIELD) {
        return None;
    }
    let paths: Vec<String> = key_fields
        .iter()
        .map(|f| format!("{}.{}", relationship, f))
        .collect();
    external_key(record, &paths)
}

/// Resolve one lookup of a source record
pub fn resolve_lookup(record: &Record, lookup: &LookupField, ctx: &LookupContext) -> Resolution {
    let value = record.get_str(&lookup.field);
    let mut path_value: Option<String> = None;
    let mut deferred = false;

    for entity in &lookup.referenced_entities {
        let key = ctx
            .key_fields(entity)
            .and_then(|fields| path_key(record, &lookup.relationship, fields));

        match ctx.index(entity) {
            Some(index) => {
                if let Some(id) = value.as_deref().and_then(|v| index.by_source_id(v)) {
                    return Resolution::Resolved(id.to_string());
                }
                if let Some(id) = key.as_deref().and_then(|k| index.by_key(k)) {
                    return Resolution::Resolved(id.to_string());
                }
            }
            None if ctx.is_pending(entity) => deferred = true,
            None => {}
        }
        if path_value.is_none() {
            path_value = key;
        }
    }

    match value.or(path_value) {
        None => Resolution::Empty,
        Some(_) if deferred => Resolution::Deferred,
        Some(shown) => Resolution::Missing(shown),
    }
}
