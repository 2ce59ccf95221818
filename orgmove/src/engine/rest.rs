//! REST engine: synchronous composite calls, positional results

use async_trait::async_trait;

use super::{ApiEngine, CrudOutcome, EngineBase, EngineOptions, EngineRecord, run_chunks};
use crate::error::Result;
use crate::model::{ApiOperation, Record};
use crate::remote::RestApi;

pub struct RestEngine {
    base: EngineBase,
}

impl RestEngine {
    pub fn new(base: EngineBase) -> Self {
        RestEngine { base }
    }

    async fn run_call(
        &self,
        api: &dyn RestApi,
        chunk: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>> {
        let payload: Vec<Record> = chunk.iter().map(|item| item.record.clone()).collect();
        let results = api
            .execute(&self.base.entity, operation, &payload, options.all_or_none)
            .await?;

        let mut results = results.into_iter();
        Ok(chunk
            .into_iter()
            .map(|item| match results.next() {
                Some(result) => CrudOutcome::from_result(item, result, options.update_record_id),
                None => CrudOutcome::unprocessed(item, "No result returned for record"),
            })
            .collect())
    }
}

#[async_trait]
impl ApiEngine for RestEngine {
    fn base(&self) -> &EngineBase {
        &self.base
    }

    async fn execute_crud(
        &self,
        records: Vec<EngineRecord>,
        operation: ApiOperation,
        options: &EngineOptions,
    ) -> Result<Vec<CrudOutcome>> {
        let api = self.base.rest()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        run_chunks(&self.base, records, options, |_, chunk| {
            self.run_call(api, chunk, operation, options)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionSettings;
    use crate::engine::test_support::{account_org, accounts, options};
    use crate::engine::{EngineKind, create_engine};
    use crate::remote::memory::{CallCounters, FAIL_MARKER};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rest_insert_in_batches() {
        let org = Arc::new(account_org());
        let engine = create_engine(EngineKind::Rest, org.clone(), "Account");
        let settings = ExecutionSettings::builder().rest_batch_size(2).build();

        let outcomes = engine
            .execute_crud(accounts(5), ApiOperation::Insert, &options(&settings, EngineKind::Rest))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.is_created && o.record.id().is_some()));
        assert_eq!(CallCounters::get(&org.counters.rest_calls), 3);
        assert_eq!(org.records("Account").len(), 5);
        assert_eq!(engine.stats().chunks, 3);
    }

    #[tokio::test]
    async fn test_record_level_failures_are_outcomes() {
        let org = Arc::new(account_org());
        let engine = create_engine(EngineKind::Rest, org.clone(), "Account");
        let mut records = accounts(2);
        records[1].record.set("Name", FAIL_MARKER);

        let outcomes = engine
            .execute_crud(
                records,
                ApiOperation::Insert,
                &options(&ExecutionSettings::default(), EngineKind::Rest),
            )
            .await
            .unwrap();
        assert!(!outcomes[0].is_failed);
        assert!(outcomes[1].is_failed);
        assert!(outcomes[1].record.id().is_none());
        assert!(outcomes[1].error_message.as_deref().unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_missing_rest_capability() {
        let org = Arc::new(account_org().without_rest());
        let engine = create_engine(EngineKind::Rest, org.clone(), "Account");
        let err = engine
            .execute_crud(
                accounts(1),
                ApiOperation::Insert,
                &options(&ExecutionSettings::default(), EngineKind::Rest),
            )
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(org.counters.total(), 0);
    }
}
