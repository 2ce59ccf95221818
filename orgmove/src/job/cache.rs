//! File-backed record cache shared by the stages of one job

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::model::Record;
use crate::remote::FileStore;

/// Records read from (or written to) files, keyed by path
///
/// Each object-set's job owns one cache; it lives for the job only.
#[derive(Debug, Default)]
pub struct RecordCache {
    entries: HashMap<PathBuf, Arc<Vec<Record>>>,
    hits: usize,
    misses: usize,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of a file, `None` when it does not exist
    pub async fn read(
        &mut self,
        store: &dyn FileStore,
        path: &Path,
    ) -> Result<Option<Arc<Vec<Record>>>> {
        if let Some(cached) = self.entries.get(path) {
            self.hits += 1;
            return Ok(Some(Arc::clone(cached)));
        }
        self.misses += 1;
        if !store.exists(path).await {
            return Ok(None);
        }

        let records = Arc::new(store.read_records(path).await?);
        debug!("Cached {} records from {}", records.len(), path.display());
        self.entries.insert(path.to_path_buf(), Arc::clone(&records));
        Ok(Some(records))
    }

    /// Write records to a file and keep them as the cached content
    pub async fn write(
        &mut self,
        store: &dyn FileStore,
        path: &Path,
        records: Vec<Record>,
    ) -> Result<()> {
        store.write_records(path, &records).await?;
        self.entries.insert(path.to_path_buf(), Arc::new(records));
        Ok(())
    }

    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CsvFileStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_each_file_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Account.csv");
        tokio::fs::write(&path, "Id,Name\n001,Acme\n").await.unwrap();

        let store = CsvFileStore::new();
        let mut cache = RecordCache::new();
        let first = cache.read(&store, &path).await.unwrap().unwrap();
        let second = cache.read(&store, &path).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(first[0].get_str("Name").as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let mut cache = RecordCache::new();
        let result = cache
            .read(&CsvFileStore::new(), &dir.path().join("Contact.csv"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_write_refreshes_cached_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Account.csv");
        let store = CsvFileStore::new();
        let mut cache = RecordCache::new();

        cache
            .write(&store, &path, vec![Record::new().with("Id", "001").with("Name", "Acme")])
            .await
            .unwrap();
        let cached = cache.read(&store, &path).await.unwrap().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cache.hits(), 1);

        cache.invalidate(&path);
        let reread = cache.read(&store, &path).await.unwrap().unwrap();
        assert_eq!(reread[0].get_str("Id").as_deref(), Some("001"));
    }
}
