//! Migration job: one object-set run through its stages
//!
//! Load → Setup → ProcessSource → Prepare → Addons(before) → Execute →
//! Addons(after). Stages only move forward. The first fatal error marks the
//! job failed and skips whatever is left; record-level failures are kept on
//! the task outcomes and never stop the job.

mod addons;
mod cache;
mod execute;
mod prepare;
mod report;
mod setup;
mod source;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{MigrationPlan, ObjectSet, SettingsOverrides};
use crate::error::{MigrationError, Result};
use crate::graph::Schedule;
use crate::metadata::{DescribeCache, EndpointMetadata, MetadataProvider};
use crate::remote::Endpoint;
use crate::task::{LookupContext, MigrationTask};

pub use addons::*;
pub use cache::RecordCache;
pub use report::*;
pub use setup::downgrade_operation;
pub use source::{SourceIssue, synthetic_id};

/// Stages of a job, in the only order they can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum JobStage {
    Load,
    Setup,
    ProcessSource,
    Prepare,
    AddonsBefore,
    Execute,
    AddonsAfter,
    Completed,
    Failed,
}

impl JobStage {
    pub fn label(&self) -> &'static str {
        match self {
            JobStage::Load => "Load",
            JobStage::Setup => "Setup",
            JobStage::ProcessSource => "ProcessSource",
            JobStage::Prepare => "Prepare",
            JobStage::AddonsBefore => "Addons(before)",
            JobStage::Execute => "Execute",
            JobStage::AddonsAfter => "Addons(after)",
            JobStage::Completed => "Completed",
            JobStage::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Completed | JobStage::Failed)
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// When a stage started and finished
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: JobStage,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Shared stop switch, checked between stages and between tasks
///
/// Cancellation never interrupts an engine call that is already running.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Aborted)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MigrationError::Aborted("cancelled".to_string()));
        }
        Ok(())
    }
}

/// One object-set's run
pub struct MigrationJob {
    id: Uuid,
    set: ObjectSet,
    source: Endpoint,
    target: Endpoint,
    excluded_objects: Vec<String>,
    cancel: CancellationFlag,
    addons: Vec<Arc<dyn AddonHook>>,
    started_at: DateTime<Utc>,
    stage_history: Vec<StageRecord>,
    schedule: Option<Schedule>,
    tasks: Vec<MigrationTask>,
    cache: RecordCache,
    metadata: DescribeCache,
    lookups: LookupContext,
    source_issues: Vec<SourceIssue>,
}

impl MigrationJob {
    /// Job for an object-set; metadata comes from whichever endpoints are orgs
    pub fn new(set: ObjectSet, source: Endpoint, target: Endpoint) -> Self {
        let provider = EndpointMetadata::new(source.org().cloned(), target.org().cloned());
        MigrationJob {
            id: Uuid::new_v4(),
            set,
            source,
            target,
            excluded_objects: Vec::new(),
            cancel: CancellationFlag::new(),
            addons: Vec::new(),
            started_at: Utc::now(),
            stage_history: Vec::new(),
            schedule: None,
            tasks: Vec::new(),
            cache: RecordCache::new(),
            metadata: DescribeCache::new(Arc::new(provider)),
            lookups: LookupContext::new(),
            source_issues: Vec::new(),
        }
    }

    pub fn with_excluded_objects(mut self, excluded: Vec<String>) -> Self {
        self.excluded_objects = excluded;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Register an addon; addons run in registration order
    pub fn with_addon(mut self, addon: Arc<dyn AddonHook>) -> Self {
        self.addons.push(addon);
        self
    }

    /// Replace the metadata provider
    pub fn with_metadata(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = DescribeCache::new(provider);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stage(&self) -> Option<JobStage> {
        self.stage_history.last().map(|r| r.stage)
    }

    pub fn tasks(&self) -> &[MigrationTask] {
        &self.tasks
    }

    /// Run every stage and return the report
    pub async fn run(mut self) -> Result<JobReport> {
        info!(
            "Job {} started: object-set '{}', {} -> {}",
            self.id,
            self.set.name,
            self.source.label(),
            self.target.label()
        );
        let result = self.run_stages().await;
        self.finish(result)
    }

    /// Run up to Prepare without writing anything
    ///
    /// Source issues are collected into the report; with `validate_only` set
    /// the first one fails the job instead.
    pub async fn validate(mut self) -> Result<JobReport> {
        info!("Job {} validating object-set '{}'", self.id, self.set.name);
        let result = self.validate_stages().await;
        self.finish(result)
    }

    /// Run Load and Setup only and return the resolved schedule
    pub async fn schedule(mut self) -> Result<Schedule> {
        self.load()?;
        self.setup().await?;
        self.schedule.take().ok_or_else(|| {
            MigrationError::configuration(format!(
                "Object-set '{}' produced no schedule",
                self.set.name
            ))
        })
    }

    async fn run_stages(&mut self) -> Result<()> {
        self.load()?;
        self.setup().await?;
        self.process_source().await?;
        self.prepare().await?;
        self.run_addons(AddonEvent::BeforeExecute).await?;
        self.execute().await?;
        self.run_addons(AddonEvent::AfterExecute).await?;
        Ok(())
    }

    async fn validate_stages(&mut self) -> Result<()> {
        self.load()?;
        self.setup().await?;
        self.process_source().await?;
        self.prepare().await
    }

    fn finish(mut self, result: Result<()>) -> Result<JobReport> {
        match result {
            Ok(()) => {
                self.enter(JobStage::Completed);
                let report = self.report();
                let totals = report.totals();
                info!(
                    "Job {} completed: {} inserted, {} updated, {} deleted, {} unchanged, {} failed",
                    self.id,
                    totals.inserted,
                    totals.updated,
                    totals.deleted,
                    totals.unchanged,
                    totals.failed
                );
                Ok(report)
            }
            Err(e) => {
                let failed_in = self.stage();
                self.enter(JobStage::Failed);
                error!(
                    "Job {} failed in {}: {}",
                    self.id,
                    failed_in.map(|s| s.label()).unwrap_or("Load"),
                    e
                );
                Err(e)
            }
        }
    }

    /// Move to the next stage and close the previous one
    fn enter(&mut self, stage: JobStage) {
        let now = Utc::now();
        if let Some(current) = self.stage_history.last_mut() {
            debug_assert!(
                stage > current.stage,
                "stage {} cannot follow {}",
                stage,
                current.stage
            );
            current.finished_at = Some(now);
        }
        if stage.is_terminal() {
            debug!("Job {} -> {}", self.id, stage);
        } else {
            info!("[{}] {}", self.set.name, stage);
        }
        self.stage_history.push(StageRecord {
            stage,
            started_at: now,
            finished_at: stage.is_terminal().then_some(now),
        });
    }

    fn load(&mut self) -> Result<()> {
        self.enter(JobStage::Load);
        self.cancel.check()?;
        self.set
            .settings
            .validate()
            .map_err(MigrationError::configuration)?;
        if !self.source.is_org() && !self.target.is_org() {
            return Err(MigrationError::configuration(
                "At least one endpoint must be an org to resolve entity metadata",
            ));
        }

        let excluded = &self.excluded_objects;
        self.set.descriptors.retain(|d| {
            let skip = excluded.iter().any(|e| e.eq_ignore_ascii_case(&d.name));
            if skip {
                warn!("{} is declared but excluded; skipping it", d.name);
            }
            !skip
        });
        if self.set.descriptors.is_empty() {
            return Err(MigrationError::configuration(format!(
                "Object-set '{}' has no objects to migrate",
                self.set.name
            )));
        }
        info!(
            "Loaded {} objects for object-set '{}'",
            self.set.descriptors.len(),
            self.set.name
        );
        Ok(())
    }

    async fn run_addons(&mut self, event: AddonEvent) -> Result<()> {
        self.enter(match event {
            AddonEvent::BeforeExecute => JobStage::AddonsBefore,
            AddonEvent::AfterExecute => JobStage::AddonsAfter,
        });
        self.cancel.check()?;

        for addon in &self.addons {
            let context = AddonContext {
                job_id: self.id,
                invocation_id: Uuid::new_v4(),
                object_set: &self.set.name,
                settings: &self.set.settings,
                tasks: &self.tasks,
            };
            debug!(
                "[{}] addon '{}' ({})",
                context.invocation_id,
                addon.name(),
                event.label()
            );
            if let AddonAction::Abort(reason) = addon.on_event(event, &context).await? {
                self.cancel.cancel();
                return Err(MigrationError::Aborted(format!(
                    "addon '{}': {}",
                    addon.name(),
                    reason
                )));
            }
        }
        Ok(())
    }

    fn task_index(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name() == name)
    }

    fn report(&self) -> JobReport {
        JobReport {
            job_id: self.id,
            object_set: self.set.name.clone(),
            source: self.source.label(),
            target: self.target.label(),
            simulation: self.set.settings.simulation,
            started_at: self.started_at,
            finished_at: Utc::now(),
            entities: self.tasks.iter().map(EntityReport::from_task).collect(),
            missing_parents: self
                .tasks
                .iter()
                .flat_map(|t| t.missing_parents.iter().cloned())
                .collect(),
            source_issues: self.source_issues.clone(),
            stage_history: self.stage_history.clone(),
        }
    }
}

/// What `run_plan` does with each object-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Execute,
    /// Stop after Prepare
    Validate,
}

/// Caller-level options for a plan run
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Applied over every object-set's settings
    pub overrides: SettingsOverrides,
    pub cancel: CancellationFlag,
    pub addons: Vec<Arc<dyn AddonHook>>,
    pub mode: RunMode,
}

fn job_for(
    plan: &MigrationPlan,
    set: ObjectSet,
    source: &Endpoint,
    target: &Endpoint,
    options: &RunOptions,
) -> MigrationJob {
    let mut job = MigrationJob::new(set, source.clone(), target.clone())
        .with_excluded_objects(plan.excluded_objects.clone())
        .with_cancellation(options.cancel.clone());
    for addon in &options.addons {
        job = job.with_addon(Arc::clone(addon));
    }
    job
}

/// Run every object-set of a plan, one after another
///
/// Each object-set gets its own job, tasks and record cache.
pub async fn run_plan(
    plan: &MigrationPlan,
    source: Endpoint,
    target: Endpoint,
    options: &RunOptions,
) -> Result<Vec<JobReport>> {
    plan.validate()?;
    let sets = plan.object_sets()?;
    let mut reports = Vec::with_capacity(sets.len());
    for mut set in sets {
        options.cancel.check()?;
        set.settings = set.settings.with_overrides(&options.overrides);
        let job = job_for(plan, set, &source, &target, options);
        let report = match options.mode {
            RunMode::Execute => job.run().await?,
            RunMode::Validate => job.validate().await?,
        };
        reports.push(report);
    }
    Ok(reports)
}

/// Resolve the schedule of every object-set without touching records
pub async fn schedule_plan(
    plan: &MigrationPlan,
    source: Endpoint,
    target: Endpoint,
) -> Result<Vec<(String, Schedule)>> {
    plan.validate()?;
    let mut schedules = Vec::new();
    for set in plan.object_sets()? {
        let name = set.name.clone();
        let job = job_for(plan, set, &source, &target, &RunOptions::default());
        schedules.push((name, job.schedule().await?));
    }
    Ok(schedules)
}
