//! orgmove
//!
//! Moves and reconciles record sets between Salesforce-style orgs and CSV
//! directories. Entities are scheduled in lookup-dependency order, matched by
//! business keys ("external Ids"), and written through REST, Bulk v1 or
//! Bulk v2 engines with chunking, polling and per-record outcome tracking.

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod job;
pub mod metadata;
pub mod model;
pub mod remote;
pub mod task;

pub use config::{ExecutionSettings, MigrationPlan, load_plan};
pub use error::{MigrationError, Result};
pub use job::{
    CancellationFlag, JobReport, MigrationJob, RecordLimitAddon, RunMode, RunOptions, run_plan,
    schedule_plan,
};
