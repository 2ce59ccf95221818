//! Plan file loading

use std::path::Path;

use log::debug;

use super::plan::MigrationPlan;
use crate::error::{MigrationError, Result};

/// Read, parse and validate a TOML plan file
///
/// Relative CSV directories are resolved against the plan file's directory.
pub async fn load_plan(path: impl AsRef<Path>) -> Result<MigrationPlan> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        MigrationError::configuration(format!("Cannot read plan {}: {}", path.display(), e))
    })?;

    let mut plan = parse_plan(&text)?;
    if let Some(base) = path.parent() {
        plan.source.resolve_relative(base);
        plan.target.resolve_relative(base);
    }
    debug!(
        "Loaded plan {} ({} top-level objects, {} object-sets)",
        path.display(),
        plan.objects.len(),
        plan.object_sets.len()
    );
    Ok(plan)
}

/// Parse and validate plan text
pub fn parse_plan(text: &str) -> Result<MigrationPlan> {
    let plan: MigrationPlan = toml::from_str(text)?;
    plan.validate()?;
    Ok(plan)
}
