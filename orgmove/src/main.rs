//! orgmove CLI - dependency-ordered record migration between orgs and CSV files

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use log::{info, warn};

use orgmove::config::{BulkApiVersion, MissingParentPolicy, SettingsOverrides};
use orgmove::{
    CancellationFlag, JobReport, MigrationPlan, RecordLimitAddon, RunMode, RunOptions, load_plan,
    run_plan, schedule_plan,
};

#[derive(Parser)]
#[command(name = "orgmove")]
#[command(about = "Move and reconcile records between orgs and CSV directories")]
#[command(version)]
struct Cli {
    /// Path to the TOML plan file
    #[arg(short, long, default_value = "orgmove.toml", global = true)]
    plan: PathBuf,

    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every object-set of the plan
    Run {
        #[command(flatten)]
        overrides: OverrideArgs,

        /// Abort before writing when more records would be written than this
        #[arg(long)]
        max_records: Option<usize>,

        /// Write one JSON report per object-set into this directory
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },

    /// Read and reconcile without writing anything
    Validate {
        /// Fail on the first source problem instead of collecting them
        #[arg(long)]
        strict: bool,

        /// Write one JSON report per object-set into this directory
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },

    /// Print the execution order of every object-set
    Order,
}

#[derive(clap::Args)]
struct OverrideArgs {
    /// Compute every outcome without writing to the target
    #[arg(long)]
    simulation: bool,

    /// Bulk API used above the bulk threshold
    #[arg(long, value_enum)]
    bulk_api: Option<BulkApiArg>,

    /// Record count from which `auto` objects use the Bulk API
    #[arg(long)]
    bulk_threshold: Option<usize>,

    /// What to do with lookups whose parent cannot be found
    #[arg(long, value_enum)]
    missing_parent: Option<MissingParentArg>,

    /// Roll back a whole REST batch when one record fails
    #[arg(long)]
    all_or_none: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum BulkApiArg {
    V1,
    V2,
}

#[derive(Clone, Copy, ValueEnum)]
enum MissingParentArg {
    Clear,
    Abort,
}

impl OverrideArgs {
    fn to_overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            simulation: self.simulation.then_some(true),
            bulk_api: self.bulk_api.map(|v| match v {
                BulkApiArg::V1 => BulkApiVersion::V1,
                BulkApiArg::V2 => BulkApiVersion::V2,
            }),
            bulk_threshold: self.bulk_threshold,
            missing_parent_policy: self.missing_parent.map(|p| match p {
                MissingParentArg::Clear => MissingParentPolicy::Clear,
                MissingParentArg::Abort => MissingParentPolicy::Abort,
            }),
            all_or_none: self.all_or_none.then_some(true),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
    if cli.no_color {
        colored::control::set_override(false);
    }

    let plan = load_plan(&cli.plan)
        .await
        .with_context(|| format!("Failed to load plan {}", cli.plan.display()))?;
    info!("Loaded plan {}", cli.plan.display());

    match cli.command {
        Commands::Run {
            overrides,
            max_records,
            report_dir,
        } => {
            let mut options = RunOptions {
                overrides: overrides.to_overrides(),
                cancel: cancel_on_ctrl_c(),
                ..Default::default()
            };
            if let Some(limit) = max_records {
                options.addons.push(Arc::new(RecordLimitAddon::new(limit)));
            }
            run(&plan, options, report_dir.as_deref()).await
        }
        Commands::Validate { strict, report_dir } => {
            let options = RunOptions {
                overrides: SettingsOverrides {
                    validate_only: strict.then_some(true),
                    ..Default::default()
                },
                cancel: cancel_on_ctrl_c(),
                mode: RunMode::Validate,
                ..Default::default()
            };
            run(&plan, options, report_dir.as_deref()).await
        }
        Commands::Order => order(&plan).await,
    }
}

/// Flag flipped by the first Ctrl-C; running engine calls finish first
fn cancel_on_ctrl_c() -> CancellationFlag {
    let cancel = CancellationFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            flag.cancel();
        }
    });
    cancel
}

async fn run(plan: &MigrationPlan, options: RunOptions, report_dir: Option<&Path>) -> Result<()> {
    let source = plan.source.connect().context("Failed to open source")?;
    let target = plan.target.connect().context("Failed to open target")?;
    let validating = options.mode == RunMode::Validate;

    let start = Instant::now();
    let reports = run_plan(plan, source, target, &options)
        .await
        .context("Migration failed")?;

    for report in &reports {
        print_report(report, validating);
    }
    println!(
        "{} {} object-set(s) in {:.1}s",
        if validating { "Validated" } else { "Finished" }.bright_green().bold(),
        reports.len(),
        start.elapsed().as_secs_f64()
    );

    if let Some(dir) = report_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for report in &reports {
            let path = dir.join(format!("{}.json", report.object_set));
            report
                .write_json(&path)
                .await
                .with_context(|| format!("Failed to write report {}", path.display()))?;
            println!("Report written to {}", path.display().to_string().cyan());
        }
    }

    let failed: usize = reports.iter().map(|r| r.totals().failed).sum();
    if failed > 0 {
        anyhow::bail!("{} records failed; see the report for details", failed);
    }
    Ok(())
}

fn print_report(report: &JobReport, validating: bool) {
    let mode = if report.simulation { " (simulation)" } else { "" };
    println!();
    println!(
        "{} {}{}",
        "Object-set".bold(),
        report.object_set.bright_cyan().bold(),
        mode.yellow()
    );
    println!("  {} -> {}", report.source.dimmed(), report.target.dimmed());

    for entity in &report.entities {
        let name = if entity.auto_added {
            format!("{} (auto)", entity.entity).dimmed().to_string()
        } else {
            entity.entity.clone()
        };
        let counts = entity.counts;
        if validating {
            println!(
                "  {:<28} {:<10} {:>6} source {:>6} target",
                name, entity.operation, counts.source, counts.target
            );
            continue;
        }
        let failed = if counts.failed > 0 {
            format!("{} failed", counts.failed).red().to_string()
        } else {
            "0 failed".dimmed().to_string()
        };
        println!(
            "  {:<28} {:<10} {:>6} ins {:>6} upd {:>6} del {:>6} same  {}  {}",
            name,
            entity.operation,
            counts.inserted,
            counts.updated,
            counts.deleted,
            counts.unchanged,
            failed,
            entity.engine.as_deref().unwrap_or("-").dimmed()
        );
    }

    if !report.missing_parents.is_empty() {
        println!(
            "  {}",
            format!("{} lookups without a parent", report.missing_parents.len()).yellow()
        );
        for missing in report.missing_parents.iter().take(10) {
            println!(
                "    {}.{} = {} ({} not found)",
                missing.entity, missing.field, missing.value, missing.referenced
            );
        }
    }
    for issue in &report.source_issues {
        println!("  {} {}", "!".yellow().bold(), issue);
    }
}

async fn order(plan: &MigrationPlan) -> Result<()> {
    let source = plan.source.connect().context("Failed to open source")?;
    let target = plan.target.connect().context("Failed to open target")?;
    let schedules = schedule_plan(plan, source, target)
        .await
        .context("Failed to resolve the execution order")?;

    for (name, schedule) in schedules {
        println!("{}", name.bright_cyan().bold());
        let auto_added = schedule.auto_added();
        for (position, entity) in schedule.execution_order().iter().enumerate() {
            let marker = if auto_added.contains(entity) {
                " (auto, readonly)".dimmed().to_string()
            } else {
                String::new()
            };
            println!("  {:>3}. {}{}", position + 1, entity, marker);
        }
    }
    Ok(())
}
