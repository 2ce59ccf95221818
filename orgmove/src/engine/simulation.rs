//! Simulation engine: synthesizes outcomes without touching the network

use async_trait::async_trait;
use log::info;
use rand::Rng;
use rand::distr::Alphanumeric;

use super::{ApiEngine, CrudOutcome, EngineBase, EngineOptions, EngineRecord};
use crate::error::Result;
use crate::model::ApiOperation;

/// Length of a synthesized record Id
pub const SIMULATED_ID_LENGTH: usize = 18;

/// 18-character Id: three characters from the entity name, then random
/// alphanumerics
pub fn simulated_id(entity: &str) -> String {
    let prefix: String = entity
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .to_uppercase();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SIMULATED_ID_LENGTH - 3)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub struct SimulationEngine {
    base: EngineBase,
}

impl SimulationEngine {
    pub fn new(base: EngineBase) -> Self {
        SimulationEngine { base }
    }
}

#[async_trait]
impl ApiEngine for SimulationEngine {
    fn base(&self) -> &EngineBase {
        &self.base
    }

    async fn execute_crud(
        &self,
        records: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>> {
        info!(
            "{}: simulating {} of {} records",
            self.base.entity,
            operation,
            records.len()
        );
        let outcomes: Vec<CrudOutcome> = records
            .into_iter()
            .map(|item| {
                let (id, created) = match operation {
                    ApiOperation::Insert => (Some(simulated_id(&self.base.entity)), true),
                    _ => (item.record.id(), false),
                };
                CrudOutcome::success(item, id, created, options.update_record_id)
            })
            .collect();
        self.base.stats.record_chunk(&outcomes);
        Ok(outcomes)
    }
}
