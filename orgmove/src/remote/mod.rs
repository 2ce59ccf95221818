//! Remote collaborators: org connections, API families, file stores
//!
//! The core never speaks a wire protocol itself. An [`OrgConnection`]
//! answers queries and describes and exposes whichever API families the
//! connected org supports; engines ask for the family they need and fail
//! with a capability error when it is absent.

mod csv_store;
mod http;
#[cfg(test)]
pub(crate) mod memory;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::metadata::EntityDescribe;
use crate::model::{ApiOperation, Record};

pub use csv_store::{CsvFileStore, csv_to_records, records_to_csv};
pub use http::{DEFAULT_API_VERSION, HttpOrgConnection, OrgCredentials};

/// Per-record result reported by REST and Bulk v1 calls (positional)
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResult {
    pub id: Option<String>,
    pub success: bool,
    pub created: bool,
    pub error: Option<String>,
}

impl RecordResult {
    pub fn ok(id: impl Into<String>, created: bool) -> Self {
        RecordResult {
            id: Some(id.into()),
            success: true,
            created,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        RecordResult {
            id: None,
            success: false,
            created: false,
            error: Some(message.into()),
        }
    }
}

/// Bulk v1 batch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Queued,
    InProgress,
    Completed,
    Failed,
    NotProcessed,
}

impl BatchState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "Queued" => BatchState::Queued,
            "InProgress" => BatchState::InProgress,
            "Completed" => BatchState::Completed,
            "Failed" => BatchState::Failed,
            _ => BatchState::NotProcessed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::NotProcessed
        )
    }
}

/// Bulk v1 batch status
#[derive(Debug, Clone)]
pub struct BatchInfo {
    pub state: BatchState,
    pub processed: usize,
    pub failed: usize,
    pub message: Option<String>,
}

/// Bulk v2 job state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Open,
    UploadComplete,
    InProgress,
    JobComplete,
    Failed,
    Aborted,
}

impl JobState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "Open" => JobState::Open,
            "UploadComplete" => JobState::UploadComplete,
            "InProgress" => JobState::InProgress,
            "JobComplete" => JobState::JobComplete,
            "Aborted" => JobState::Aborted,
            _ => JobState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::JobComplete | JobState::Failed | JobState::Aborted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Bulk v2 job status
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub state: JobState,
    pub processed: usize,
    pub failed: usize,
    pub message: Option<String>,
}

/// Bulk v2 result sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    Successful,
    Failed,
    Unprocessed,
}

/// Synchronous record-level DML (composite calls of a few hundred records)
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn execute(
        &self,
        entity: &str,
        operation: ApiOperation,
        records: &[Record],
        all_or_none: bool,
    ) -> Result<Vec<RecordResult>>;
}

/// Bulk API v1: job + batch lifecycle with positional results
#[async_trait]
pub trait BulkV1Api: Send + Sync {
    async fn create_job(&self, entity: &str, operation: ApiOperation) -> Result<String>;
    async fn add_batch(&self, job_id: &str, records: &[Record]) -> Result<String>;
    async fn close_job(&self, job_id: &str) -> Result<()>;
    async fn batch_status(&self, job_id: &str, batch_id: &str) -> Result<BatchInfo>;
    async fn batch_results(&self, job_id: &str, batch_id: &str) -> Result<Vec<RecordResult>>;
}

/// Bulk API v2: one ingest job per upload, result sets fetched as records
#[async_trait]
pub trait BulkV2Api: Send + Sync {
    async fn create_job(&self, entity: &str, operation: ApiOperation) -> Result<String>;
    async fn upload(&self, job_id: &str, records: &[Record]) -> Result<()>;
    async fn close_job(&self, job_id: &str) -> Result<()>;
    async fn job_status(&self, job_id: &str) -> Result<JobInfo>;
    /// Rows carry `sf__Id`, `sf__Created` / `sf__Error` plus the uploaded columns
    async fn results(&self, job_id: &str, set: ResultSet) -> Result<Vec<Record>>;
}

/// A connected org
#[async_trait]
pub trait OrgConnection: Send + Sync {
    /// Connection alias used in logs and errors
    fn name(&self) -> &str;

    /// Describe an entity
    async fn describe(&self, entity: &str) -> Result<EntityDescribe>;

    /// Run a query and return every matching record
    async fn query(&self, soql: &str) -> Result<Vec<Record>>;

    fn rest(&self) -> Option<&dyn RestApi>;
    fn bulk_v1(&self) -> Option<&dyn BulkV1Api>;
    fn bulk_v2(&self) -> Option<&dyn BulkV2Api>;
}

/// Flat-file record storage
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read_records(&self, path: &Path) -> Result<Vec<Record>>;
    async fn write_records(&self, path: &Path, records: &[Record]) -> Result<()>;
    async fn exists(&self, path: &Path) -> bool;
}

/// One side of a migration
#[derive(Clone)]
pub enum Endpoint {
    Org(Arc<dyn OrgConnection>),
    Files {
        directory: PathBuf,
        store: Arc<dyn FileStore>,
    },
}

impl Endpoint {
    /// CSV directory endpoint backed by [`CsvFileStore`]
    pub fn csv(directory: impl Into<PathBuf>) -> Self {
        Endpoint::Files {
            directory: directory.into(),
            store: Arc::new(CsvFileStore::new()),
        }
    }

    /// The org connection, when this is an org endpoint
    pub fn org(&self) -> Option<&Arc<dyn OrgConnection>> {
        match self {
            Endpoint::Org(connection) => Some(connection),
            Endpoint::Files { .. } => None,
        }
    }

    pub fn is_org(&self) -> bool {
        self.org().is_some()
    }

    /// Path of an entity's file, for file endpoints
    pub fn entity_file(&self, entity: &str) -> Option<PathBuf> {
        match self {
            Endpoint::Org(_) => None,
            Endpoint::Files { directory, .. } => Some(directory.join(format!("{}.csv", entity))),
        }
    }

    /// Label for logs
    pub fn label(&self) -> String {
        match self {
            Endpoint::Org(connection) => format!("org '{}'", connection.name()),
            Endpoint::Files { directory, .. } => format!("csv '{}'", directory.display()),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.label())
    }
}
