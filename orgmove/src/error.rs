//! Error taxonomy for migration runs
//!
//! Configuration and capability errors mean "fix the plan or the org and
//! rerun". Record-level API failures never surface here; they are captured on
//! the individual `CrudOutcome` instead.

use std::time::Duration;

use thiserror::Error;

use crate::engine::CrudOutcome;

/// Main error type for migration operations
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Invalid plan, malformed query, missing external-Id metadata
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A lookup value could not be resolved and the policy is to abort
    #[error(
        "Missing parent record for {entity}.{field} = '{value}' (referenced entity: {referenced})"
    )]
    MissingParent {
        entity: String,
        field: String,
        value: String,
        referenced: String,
    },

    /// The active connection does not offer the API an engine needs
    #[error("{engine} is not available on connection '{connection}' (entity {entity})")]
    Capability {
        engine: String,
        connection: String,
        entity: String,
    },

    /// A remote job or batch did not reach a terminal state in time
    #[error("Job {job_id} for {entity} did not finish within {timeout:?}")]
    PollTimeout {
        entity: String,
        job_id: String,
        timeout: Duration,
    },

    /// A remote job reached a failed or aborted state
    #[error("{operation} job for {entity} failed: {message}")]
    JobFailed {
        entity: String,
        operation: String,
        message: String,
    },

    /// A chunk failed after other chunks of the same call were written
    ///
    /// `outcomes` covers every record of the call: the written chunks with
    /// their results, the failed chunk's records as failed.
    #[error("{source}")]
    PartialWrite {
        source: Box<MigrationError>,
        outcomes: Vec<CrudOutcome>,
    },

    /// Non-success response from the remote API
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Source data problems found while running in validate-only mode
    #[error("Source validation failed: {0}")]
    SourceValidation(String),

    /// A value transform could not be applied
    #[error("Transform failed for {entity}.{field}: {message}")]
    Transform {
        entity: String,
        field: String,
        message: String,
    },

    /// The run was cancelled by the user or an addon
    #[error("Migration aborted: {0}")]
    Aborted(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML plan parse error
    #[error("Plan file error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MigrationError>;

impl MigrationError {
    /// Create a Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        MigrationError::Configuration(message.into())
    }

    /// Create a JobFailed error
    pub fn job_failed(
        entity: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MigrationError::JobFailed {
            entity: entity.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Errors the user fixes by changing the plan or the org, then rerunning
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MigrationError::Configuration(_)
                | MigrationError::Capability { .. }
                | MigrationError::SourceValidation(_)
                | MigrationError::Toml(_)
        )
    }

    /// The underlying error plus any outcomes it carries
    pub fn into_parts(self) -> (MigrationError, Vec<CrudOutcome>) {
        match self {
            MigrationError::PartialWrite { source, outcomes } => (*source, outcomes),
            other => (other, Vec::new()),
        }
    }

    /// Poll timeouts only fail the chunk that was being polled
    pub fn is_poll_timeout(&self) -> bool {
        matches!(self, MigrationError::PollTimeout { .. })
    }
}
