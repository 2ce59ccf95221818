//! Concurrency limiter for chunk fan-out
//!
//! Bounds how many chunks of one task talk to the remote API at once
//! (`parallel_bulk_jobs` / `parallel_rest_jobs`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{MigrationError, Result};

/// Semaphore-based limiter for concurrent chunks
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    acquired: Arc<AtomicU64>,
    waited: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// Permit held while a chunk runs; releases on drop
#[derive(Debug)]
pub struct ChunkPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ChunkPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `max_concurrent` chunks (at least one)
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            acquired: Arc::new(AtomicU64::new(0)),
            waited: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a permit, waiting while at capacity
    pub async fn acquire(&self) -> Result<ChunkPermit> {
        if self.semaphore.available_permits() == 0 {
            self.waited.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Concurrency limiter: waiting for permit ({} in use)",
                self.max_concurrent
            );
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MigrationError::Aborted("concurrency limiter closed".to_string()))?;
        Ok(self.track(permit))
    }

    /// Acquire a permit without waiting
    pub fn try_acquire(&self) -> Option<ChunkPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> ChunkPermit {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        debug!(
            "Concurrency limiter: acquired permit ({}/{} in use)",
            now, self.max_concurrent
        );
        ChunkPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Get current statistics
    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            available_permits: self.available_permits(),
            max_concurrent: self.max_concurrent,
            acquired: self.acquired.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Statistics for the concurrency limiter
#[derive(Debug, Clone)]
pub struct ConcurrencyStats {
    pub available_permits: usize,
    pub max_concurrent: usize,
    /// Total permits handed out
    pub acquired: u64,
    /// Acquisitions that found the limiter at capacity
    pub waited: u64,
    /// Highest number of permits held at the same time
    pub peak_in_flight: usize,
}

impl ConcurrencyStats {
    /// Share of acquisitions that had to wait
    pub fn wait_rate(&self) -> f64 {
        if self.acquired == 0 {
            0.0
        } else {
            self.waited as f64 / self.acquired as f64
        }
    }

    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available_permits)
    }
}
