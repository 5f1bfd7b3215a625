//! Concurrency planning module for RadioGrab
//!
//! Derives the capture concurrency bound from configuration and CPU count, and
//! provides the admission queue that enforces it.

use crate::config::Config;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of captures running at once
    pub max_concurrent_captures: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// An explicit non-zero `max_concurrent_captures` wins; otherwise two
    /// captures per logical core. Never below one.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_captures = if cfg.capture.max_concurrent_captures > 0 {
            cfg.capture.max_concurrent_captures
        } else {
            total_cores.saturating_mul(2)
        }
        .max(1);

        Self {
            total_cores,
            max_concurrent_captures,
        }
    }
}

/// Bounded admission for capture jobs with a simple FIFO queue
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    queued: Arc<AtomicUsize>,
}

/// Held for the lifetime of one admitted capture
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionControl {
    pub fn new(plan: &ConcurrencyPlan) -> Self {
        let capacity = plan.max_concurrent_captures.max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a slot; `None` when cancelled while queued
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<AdmissionPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Some(AdmissionPermit { _permit: permit });
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        let result = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);
        result.map(|permit| AdmissionPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}
