//! CSV file store
//!
//! One file per entity, header row of field names. Empty cells read back as
//! null so a CSV round trip compares equal to the typed records it came from.

use std::path::Path;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::FileStore;
use crate::error::Result;
use crate::model::{FieldMap, Record, value_to_string};

/// File store reading and writing `<Entity>.csv` files
#[derive(Debug, Clone, Default)]
pub struct CsvFileStore;

impl CsvFileStore {
    pub fn new() -> Self {
        CsvFileStore
    }
}

#[async_trait]
impl FileStore for CsvFileStore {
    async fn read_records(&self, path: &Path) -> Result<Vec<Record>> {
        let text = tokio::fs::read_to_string(path).await?;
        let records = csv_to_records(&text)?;
        debug!("Read {} records from {}", records.len(), path.display());
        Ok(records)
    }

    async fn write_records(&self, path: &Path, records: &[Record]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = records_to_csv(records)?;
        tokio::fs::write(path, text).await?;
        debug!("Wrote {} records to {}", records.len(), path.display());
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

/// Parse CSV text with a header row into records
pub fn csv_to_records(text: &str) -> Result<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut fields = FieldMap::new();
        for (idx, header) in headers.iter().enumerate() {
            let value = match row.get(idx) {
                Some(cell) if !cell.is_empty() => Value::String(cell.to_string()),
                _ => Value::Null,
            };
            fields.insert(header.clone(), value);
        }
        records.push(Record::from_map(fields));
    }
    Ok(records)
}

/// Render records as CSV text; columns are the union of fields in first-seen order
pub fn records_to_csv(records: &[Record]) -> Result<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for name in record.field_names() {
            if name != "attributes" && !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if columns.is_empty() {
        return Ok(String::new());
    }
    writer.write_record(&columns)?;
    for record in records {
        let row: Vec<String> = columns
            .iter()
            .map(|c| record.get(c).and_then(value_to_string).unwrap_or_default())
            .collect();
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_csv_text_conversion() {
        let records = vec![
            Record::new().with("Name", "Acme, Inc").with("Phone", Value::Null),
            Record::new().with("Name", "Globex").with("Industry", "Energy"),
        ];
        let text = records_to_csv(&records).unwrap();
        assert!(text.starts_with("Name,Phone,Industry"));

        let parsed = csv_to_records(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].get_str("Name").as_deref(), Some("Acme, Inc"));
        assert_eq!(parsed[0].get("Phone"), Some(&Value::Null));
        assert_eq!(parsed[1].get_str("Industry").as_deref(), Some("Energy"));
    }

    #[test]
    fn test_empty_record_list() {
        assert_eq!(records_to_csv(&[]).unwrap(), "");
    }

    #[tokio::test]
    async fn test_store_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("Account.csv");
        let store = CsvFileStore::new();

        assert!(!store.exists(&path).await);
        store
            .write_records(&path, &[Record::new().with("Id", "001A").with("Name", "Acme")])
            .await
            .unwrap();
        assert!(store.exists(&path).await);

        let records = store.read_records(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id().as_deref(), Some("001A"));
    }
}
