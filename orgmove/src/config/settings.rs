//! Execution settings with builder pattern
//!
//! Every tunable of a run lives here and is passed by reference to the job,
//! tasks and engines. Object-sets and CLI flags apply scoped overrides with
//! [`ExecutionSettings::with_overrides`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when a lookup value has no matching parent record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingParentPolicy {
    /// Clear the lookup, log a warning and keep going
    #[default]
    Clear,
    /// Stop the job
    Abort,
}

/// Bulk API version used when `api_mode = "auto"` crosses the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkApiVersion {
    V1,
    #[default]
    V2,
}

/// Tunables for a migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Delay between job/batch status polls
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Hard wall-clock limit for one job or batch
    #[serde(with = "duration_ms", rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    /// Record count from which writes go through a bulk API
    pub bulk_threshold: usize,
    pub bulk_api: BulkApiVersion,
    pub bulk_v1_batch_size: usize,
    pub rest_batch_size: usize,
    pub bulk_v2_chunk_size: usize,
    /// Concurrent bulk jobs/batches per task
    pub parallel_bulk_jobs: usize,
    /// Concurrent REST calls per task
    pub parallel_rest_jobs: usize,
    pub missing_parent_policy: MissingParentPolicy,
    pub all_or_none: bool,
    /// Engines write created Ids back onto the records they return
    pub update_record_id: bool,
    /// Synthesize results locally, never write remotely
    pub simulation: bool,
    /// Abort on the first source data issue
    pub validate_only: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(600),
            bulk_threshold: 200,
            bulk_api: BulkApiVersion::V2,
            bulk_v1_batch_size: 9_500,
            rest_batch_size: 200,
            bulk_v2_chunk_size: 100_000,
            parallel_bulk_jobs: 1,
            parallel_rest_jobs: 1,
            missing_parent_policy: MissingParentPolicy::Clear,
            all_or_none: false,
            update_record_id: true,
            simulation: false,
            validate_only: false,
        }
    }
}

/// Partial settings layered over a base (object-set or CLI scope)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverrides {
    pub bulk_threshold: Option<usize>,
    pub bulk_api: Option<BulkApiVersion>,
    pub missing_parent_policy: Option<MissingParentPolicy>,
    pub all_or_none: Option<bool>,
    pub update_record_id: Option<bool>,
    pub simulation: Option<bool>,
    pub validate_only: Option<bool>,
    pub parallel_bulk_jobs: Option<usize>,
    pub parallel_rest_jobs: Option<usize>,
}

impl SettingsOverrides {
    pub fn is_empty(&self) -> bool {
        self == &SettingsOverrides::default()
    }
}

impl ExecutionSettings {
    /// Create a new builder for ExecutionSettings
    pub fn builder() -> ExecutionSettingsBuilder {
        ExecutionSettingsBuilder::new()
    }

    /// Settings for tests: no waiting between polls, short timeout
    pub fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// A copy with the overrides applied; `self` is left untouched
    pub fn with_overrides(&self, overrides: &SettingsOverrides) -> Self {
        let mut settings = self.clone();
        if let Some(v) = overrides.bulk_threshold {
            settings.bulk_threshold = v;
        }
        if let Some(v) = overrides.bulk_api {
            settings.bulk_api = v;
        }
        if let Some(v) = overrides.missing_parent_policy {
            settings.missing_parent_policy = v;
        }
        if let Some(v) = overrides.all_or_none {
            settings.all_or_none = v;
        }
        if let Some(v) = overrides.update_record_id {
            settings.update_record_id = v;
        }
        if let Some(v) = overrides.simulation {
            settings.simulation = v;
        }
        if let Some(v) = overrides.validate_only {
            settings.validate_only = v;
        }
        if let Some(v) = overrides.parallel_bulk_jobs {
            settings.parallel_bulk_jobs = v;
        }
        if let Some(v) = overrides.parallel_rest_jobs {
            settings.parallel_rest_jobs = v;
        }
        settings
    }

    /// Reject values that would stall or divide by zero
    pub fn validate(&self) -> Result<(), String> {
        let sizes = [
            ("bulk_v1_batch_size", self.bulk_v1_batch_size),
            ("rest_batch_size", self.rest_batch_size),
            ("bulk_v2_chunk_size", self.bulk_v2_chunk_size),
            ("parallel_bulk_jobs", self.parallel_bulk_jobs),
            ("parallel_rest_jobs", self.parallel_rest_jobs),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        if self.poll_timeout < self.poll_interval {
            return Err("poll_timeout_ms must not be shorter than poll_interval_ms".to_string());
        }
        Ok(())
    }
}

/// Builder for ExecutionSettings
#[derive(Debug)]
pub struct ExecutionSettingsBuilder {
    settings: ExecutionSettings,
}

impl ExecutionSettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: ExecutionSettings::default(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.settings.poll_timeout = timeout;
        self
    }

    pub fn bulk_threshold(mut self, threshold: usize) -> Self {
        self.settings.bulk_threshold = threshold;
        self
    }

    pub fn bulk_api(mut self, version: BulkApiVersion) -> Self {
        self.settings.bulk_api = version;
        self
    }

    pub fn bulk_v1_batch_size(mut self, size: usize) -> Self {
        self.settings.bulk_v1_batch_size = size;
        self
    }

    pub fn rest_batch_size(mut self, size: usize) -> Self {
        self.settings.rest_batch_size = size;
        self
    }

    pub fn bulk_v2_chunk_size(mut self, size: usize) -> Self {
        self.settings.bulk_v2_chunk_size = size;
        self
    }

    /// Concurrent bulk jobs per task
    pub fn parallel_bulk_jobs(mut self, jobs: usize) -> Self {
        self.settings.parallel_bulk_jobs = jobs;
        self
    }

    /// Concurrent REST calls per task
    pub fn parallel_rest_jobs(mut self, jobs: usize) -> Self {
        self.settings.parallel_rest_jobs = jobs;
        self
    }

    pub fn missing_parent_policy(mut self, policy: MissingParentPolicy) -> Self {
        self.settings.missing_parent_policy = policy;
        self
    }

    pub fn all_or_none(mut self, enabled: bool) -> Self {
        self.settings.all_or_none = enabled;
        self
    }

    pub fn update_record_id(mut self, enabled: bool) -> Self {
        self.settings.update_record_id = enabled;
        self
    }

    pub fn simulation(mut self, enabled: bool) -> Self {
        self.settings.simulation = enabled;
        self
    }

    pub fn validate_only(mut self, enabled: bool) -> Self {
        self.settings.validate_only = enabled;
        self
    }

    /// Build the final settings
    pub fn build(self) -> ExecutionSettings {
        self.settings
    }
}

impl Default for ExecutionSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
