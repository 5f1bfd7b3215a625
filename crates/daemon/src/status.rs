//! Status module for RadioGrab
//!
//! The shared snapshot of job activity served by the status endpoint.

use crate::housekeeping::SweepReport;
use crate::jobs::{current_timestamp_ms, JobStatus, RecordingJob};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of finished jobs kept in the snapshot
pub const RECENT_JOBS_LIMIT: usize = 50;

/// Complete status snapshot including recent jobs and aggregate counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub running: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Active jobs first, then finished ones newest first
    pub recent_jobs: Vec<RecordingJob>,
    pub last_sweep: Option<SweepReport>,
}

/// Shared status state for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

impl StatusSnapshot {
    /// Insert or replace a job, updating counters on terminal transitions
    pub fn upsert_job(&mut self, job: &RecordingJob) {
        let previous = self
            .recent_jobs
            .iter()
            .position(|j| j.id == job.id)
            .map(|idx| self.recent_jobs.remove(idx));
        let was_terminal = previous.as_ref().is_some_and(RecordingJob::is_terminal);

        if job.is_terminal() && !was_terminal {
            match job.status {
                JobStatus::Completed => self.completed += 1,
                JobStatus::Failed => self.failed += 1,
                JobStatus::Cancelled => self.cancelled += 1,
                _ => {}
            }
        }

        self.recent_jobs.insert(0, job.clone());
        self.recent_jobs.sort_by_key(|j| j.is_terminal());

        let active = self.recent_jobs.iter().filter(|j| !j.is_terminal()).count();
        self.recent_jobs.truncate(active + RECENT_JOBS_LIMIT);

        self.running = self
            .recent_jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count();
        self.queued = active - self.running;
        self.timestamp_unix_ms = current_timestamp_ms();
    }

    pub fn record_sweep(&mut self, report: SweepReport) {
        self.last_sweep = Some(report);
        self.timestamp_unix_ms = current_timestamp_ms();
    }
}
