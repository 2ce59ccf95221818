//! Chunk fan-out shared by the engines

use std::future::Future;

use futures::future::join_all;
use log::{debug, warn};

use super::concurrency::ConcurrencyLimiter;
use super::{CrudOutcome, EngineBase, EngineOptions, EngineRecord};
use crate::error::{MigrationError, Result};

/// Split records into chunks of at most `size`
pub fn chunk_records(records: Vec<EngineRecord>, size: usize) -> Vec<Vec<EngineRecord>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(records.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(records.len()));
    for record in records {
        current.push(record);
        if current.len() == size {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Run `run` over every chunk, at most `options.parallelism` at a time
///
/// Outcomes come back in chunk order. A chunk whose job timed out yields
/// unprocessed outcomes for its own records and the other chunks carry on.
/// Any other chunk error marks that chunk's records failed and is returned
/// once all chunks have settled, wrapped in `PartialWrite` together with every
/// outcome when at least one other chunk went through.
pub async fn run_chunks<F, Fut>(
    base: &EngineBase,
    records: Vec<EngineRecord>,
    options: &EngineOptions,
    run: F,
) -> Result<Vec<CrudOutcome>>
where
    F: Fn(usize, Vec<EngineRecord>) -> Fut,
    Fut: Future<Output = Result<Vec<CrudOutcome>>>,
{
    let chunks = chunk_records(records, options.chunk_size);
    let total = chunks.len();
    let limiter = ConcurrencyLimiter::new(options.parallelism);
    let run = &run;

    let futures = chunks.into_iter().enumerate().map(|(index, chunk)| {
        let limiter = limiter.clone();
        async move {
            let pending = chunk.clone();
            let result = async {
                let _permit = limiter.acquire().await?;
                debug!(
                    "{} {}: chunk {}/{} ({} records)",
                    base.kind,
                    base.entity,
                    index + 1,
                    total,
                    chunk.len()
                );
                run(index, chunk).await
            }
            .await;

            match result {
                Ok(outcomes) => {
                    base.stats.record_chunk(&outcomes);
                    Ok(outcomes)
                }
                Err(err) if err.is_poll_timeout() => {
                    warn!("{}: chunk {}/{} abandoned: {}", base.entity, index + 1, total, err);
                    let message = err.to_string();
                    let outcomes: Vec<CrudOutcome> = pending
                        .into_iter()
                        .map(|item| CrudOutcome::unprocessed(item, message.clone()))
                        .collect();
                    base.stats.record_chunk(&outcomes);
                    Ok(outcomes)
                }
                Err(err) => {
                    warn!("{}: chunk {}/{} failed: {}", base.entity, index + 1, total, err);
                    let message = err.to_string();
                    let outcomes: Vec<CrudOutcome> = pending
                        .into_iter()
                        .map(|item| CrudOutcome::failed(item, message.clone()))
                        .collect();
                    base.stats.record_chunk(&outcomes);
                    Err((err, outcomes))
                }
            }
        }
    });

    let mut outcomes = Vec::new();
    let mut failure: Option<MigrationError> = None;
    let mut settled = 0;
    for result in join_all(futures).await {
        match result {
            Ok(chunk) => {
                settled += 1;
                outcomes.extend(chunk);
            }
            Err((err, failed)) => {
                outcomes.extend(failed);
                failure.get_or_insert(err);
            }
        }
    }

    match failure {
        None => Ok(outcomes),
        Some(err) if settled == 0 => Err(err),
        Some(err) => Err(MigrationError::PartialWrite {
            source: Box::new(err),
            outcomes,
        }),
    }
}
