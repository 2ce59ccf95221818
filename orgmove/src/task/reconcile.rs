//! Source → target record matching

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::MigrationTask;
use crate::model::{Record, external_key, is_comparable_field, subset_hash};

/// How the source→target map was built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileStats {
    pub matched_by_key: usize,
    pub matched_by_hash: usize,
    pub unmatched: usize,
    /// Sources whose key pointed at a target already claimed
    pub duplicates: usize,
}

impl ReconcileStats {
    pub fn matched(&self) -> usize {
        self.matched_by_key + self.matched_by_hash
    }
}

impl MigrationTask {
    /// Source fields compared when a record has no business key
    fn hash_fields(&self) -> Vec<String> {
        self.descriptor
            .query
            .direct_fields()
            .filter(|f| is_comparable_field(f, &self.descriptor.excluded_fields))
            .filter(|f| self.descriptor.lookup(f).is_none())
            .cloned()
            .collect()
    }

    /// Copy of a source record's fields under their target names
    fn renamed(&self, record: &Record, fields: &[String]) -> Record {
        let mut renamed = Record::new();
        for field in fields {
            if let Some(value) = record.get(field) {
                renamed.set(self.descriptor.target_field(field), value.clone());
            }
        }
        renamed
    }

    /// Build the source→target map
    ///
    /// Sources are visited in order and the first source to claim a target
    /// wins, so the map is injective. Records with a business key match on
    /// the normalized key; records without one fall back to a hash over their
    /// comparable, non-lookup fields.
    pub fn reconcile(&mut self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let mut map = HashMap::new();
        let mut claimed: HashSet<usize> = HashSet::new();

        let hash_fields = self.hash_fields();
        let target_hash_fields: Vec<String> = hash_fields
            .iter()
            .map(|f| self.descriptor.target_field(f).to_string())
            .collect();
        let mut by_hash: Option<HashMap<u64, VecDeque<usize>>> = None;

        let source_keys = self.source.key_fields().to_vec();
        for (s, record) in self.source.iter() {
            match external_key(record, &source_keys) {
                Some(key) => match self.target.index_of_key(&key) {
                    Some(t) if claimed.insert(t) => {
                        map.insert(s, t);
                        stats.matched_by_key += 1;
                    }
                    Some(_) => {
                        debug!(
                            "{}: duplicate key '{}' in source; record {} is treated as new",
                            self.descriptor.name, key, s
                        );
                        stats.duplicates += 1;
                        stats.unmatched += 1;
                    }
                    None => stats.unmatched += 1,
                },
                None if hash_fields.is_empty() => stats.unmatched += 1,
                None => {
                    let index = by_hash.get_or_insert_with(|| {
                        let mut index: HashMap<u64, VecDeque<usize>> = HashMap::new();
                        for (t, target) in self.target.iter() {
                            index
                                .entry(subset_hash(target, &target_hash_fields))
                                .or_default()
                                .push_back(t);
                        }
                        index
                    });
                    let hash = subset_hash(&self.renamed(record, &hash_fields), &target_hash_fields);
                    let candidate = index
                        .get_mut(&hash)
                        .and_then(|queue| {
                            while let Some(t) = queue.pop_front() {
                                if !claimed.contains(&t) {
                                    return Some(t);
                                }
                            }
                            None
                        });
                    match candidate {
                        Some(t) => {
                            claimed.insert(t);
                            map.insert(s, t);
                            stats.matched_by_hash += 1;
                        }
                        None => stats.unmatched += 1,
                    }
                }
            }
        }

        debug!(
            "{}: {} matched by key, {} by hash, {} unmatched",
            self.descriptor.name, stats.matched_by_key, stats.matched_by_hash, stats.unmatched
        );
        self.source_to_target = map;
        stats
    }
}
