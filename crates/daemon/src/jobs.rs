//! Recording job module.
//!
//! A `RecordingJob` is the ephemeral record of one capture run, created at
//! trigger time and discarded once finalization is done. Only its outcome is
//! persisted (as a recording row and the show's rolling capture status).

use crate::capture::CaptureTool;
use crate::store::SourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Status of a recording job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an admission permit.
    Queued,
    /// Capture or finalization in progress.
    Running,
    /// A recording exists for the slot (including benign duplicates).
    Completed,
    /// Every tool failed or the capture was rejected.
    Failed,
    /// Stopped by request or shutdown.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One capture run for a show.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingJob {
    pub id: Uuid,
    pub show_id: i64,
    pub stream_url: String,
    pub scheduled_start: DateTime<Utc>,
    /// Target capture duration.
    pub duration: Duration,
    pub source_type: SourceType,
    pub status: JobStatus,
    /// Capture tools launched so far.
    pub attempts: u32,
    /// Tools in the order they were tried.
    pub tool_sequence: Vec<CaptureTool>,
    pub error: Option<String>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last status change.
    pub updated_at: i64,
}

impl RecordingJob {
    pub fn new(
        show_id: i64,
        stream_url: impl Into<String>,
        scheduled_start: DateTime<Utc>,
        duration: Duration,
        source_type: SourceType,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: Uuid::new_v4(),
            show_id,
            stream_url: stream_url.into(),
            scheduled_start,
            duration,
            source_type,
            status: JobStatus::Queued,
            attempts: 0,
            tool_sequence: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.touch();
    }

    /// Record the tools the orchestrator tried.
    pub fn record_attempts(&mut self, tools: Vec<CaptureTool>) {
        self.attempts = tools.len() as u32;
        self.tool_sequence = tools;
        self.touch();
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.touch();
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = JobStatus::Failed;
        self.error = Some(reason.to_string());
        self.touch();
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.touch();
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
