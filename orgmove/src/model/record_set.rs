//! Indexed record arena owned by a task side (source or target)

use std::collections::HashMap;

use super::key::external_key;
use super::record::Record;

/// Records plus identifier and external-key indexes
///
/// Records are addressed by their position in the arena; positions never
/// change, so indexes and source→target maps stay valid while engines write
/// outcomes back. Duplicate keys keep the first record.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    removed: Vec<bool>,
    id_index: HashMap<String, usize>,
    key_index: HashMap<String, usize>,
    key_fields: Vec<String>,
}

impl RecordSet {
    /// Create an empty set keyed by the given external-Id fields
    pub fn new(key_fields: Vec<String>) -> Self {
        RecordSet {
            key_fields,
            ..Default::default()
        }
    }

    /// Build a set from records, indexing every one
    pub fn from_records(records: Vec<Record>, key_fields: Vec<String>) -> Self {
        let mut set = RecordSet::new(key_fields);
        for record in records {
            set.push(record);
        }
        set
    }

    /// Add a record, returning its arena position
    pub fn push(&mut self, record: Record) -> usize {
        let idx = self.records.len();
        self.records.push(record);
        self.removed.push(false);
        self.reindex(idx);
        idx
    }

    /// Refresh index entries for a record after its Id or key fields changed
    pub fn reindex(&mut self, idx: usize) {
        let Some(record) = self.records.get(idx) else {
            return;
        };
        if self.removed[idx] {
            return;
        }
        if let Some(id) = record.id() {
            self.id_index.entry(id).or_insert(idx);
        }
        if let Some(key) = external_key(record, &self.key_fields) {
            self.key_index.entry(key).or_insert(idx);
        }
    }

    /// Drop a record from the indexes (deleted remotely); the arena slot stays
    pub fn mark_removed(&mut self, idx: usize) {
        if idx >= self.records.len() || self.removed[idx] {
            return;
        }
        self.removed[idx] = true;
        self.id_index.retain(|_, v| *v != idx);
        self.key_index.retain(|_, v| *v != idx);
    }

    /// Whether the record at `idx` was removed
    pub fn is_removed(&self, idx: usize) -> bool {
        self.removed.get(idx).copied().unwrap_or(true)
    }

    pub fn get(&self, idx: usize) -> Option<&Record> {
        self.records.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.records.get_mut(idx)
    }

    /// All records including removed slots
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Live records with their positions
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Record)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.removed[*idx])
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.removed.iter().filter(|r| !**r).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the record with this system identifier
    pub fn index_of_id(&self, id: &str) -> Option<usize> {
        self.id_index.get(id).copied()
    }

    /// Position of the record with this normalized external key
    pub fn index_of_key(&self, key: &str) -> Option<usize> {
        self.key_index.get(key).copied()
    }

    /// Normalized external key of the record at `idx`
    pub fn key_of(&self, idx: usize) -> Option<String> {
        self.records
            .get(idx)
            .and_then(|r| external_key(r, &self.key_fields))
    }

    /// External-Id fields this set is keyed by
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Identifier → position map
    pub fn id_index(&self) -> &HashMap<String, usize> {
        &self.id_index
    }

    /// External key → position map
    pub fn key_index(&self) -> &HashMap<String, usize> {
        &self.key_index
    }
}
