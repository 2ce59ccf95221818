//! Fixed-interval polling with a hard wall-clock timeout

use std::future::Future;
use std::time::Duration;

use log::trace;
use tokio::time::Instant;

use crate::error::{MigrationError, Result};

/// Poll `check` every `interval` until it yields a value
///
/// There is no backoff and no retry: an error from `check` ends the loop, and
/// so does reaching `timeout`, which yields [`MigrationError::PollTimeout`].
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    entity: &str,
    job_id: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let mut attempt = 0usize;
    loop {
        tokio::time::sleep(interval).await;
        attempt += 1;

        if let Some(value) = check().await? {
            trace!("{} job {} finished after {} polls", entity, job_id, attempt);
            return Ok(value);
        }

        if started.elapsed() >= timeout {
            return Err(MigrationError::PollTimeout {
                entity: entity.to_string(),
                job_id: job_id.to_string(),
                timeout,
            });
        }
        trace!("{} job {} still running (poll {})", entity, job_id, attempt);
    }
}
