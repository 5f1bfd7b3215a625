//! Job executor module for RadioGrab
//!
//! Runs one recording job end to end: admission, tool selection, capture,
//! finalization and the rolling status write-back.

use crate::capture::{CaptureError, CaptureOrchestrator};
use crate::compat::CompatibilityTester;
use crate::concurrency::{AdmissionControl, ConcurrencyPlan};
use crate::config::Config;
use crate::finalize::{FinalizeError, FinalizeRequest, Finalizer};
use crate::jobs::RecordingJob;
use crate::status::SharedStatus;
use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs recording jobs dispatched by the scheduler
#[async_trait]
pub trait RecordingRunner: Send + Sync {
    /// Drive `job` to a terminal state and return it
    async fn run(&self, job: RecordingJob, cancel: CancellationToken) -> RecordingJob;
}

/// Production runner backed by the capture and finalization pipeline
#[derive(Clone)]
pub struct JobExecutor {
    store: Store,
    admission: AdmissionControl,
    orchestrator: CaptureOrchestrator,
    tester: CompatibilityTester,
    finalizer: Finalizer,
    status: SharedStatus,
    capture_dir: PathBuf,
}

impl JobExecutor {
    pub fn new(
        store: Store,
        config: &Config,
        tester: CompatibilityTester,
        finalizer: Finalizer,
        status: SharedStatus,
    ) -> Self {
        let plan = ConcurrencyPlan::derive(config);
        info!(
            total_cores = plan.total_cores,
            max_concurrent_captures = plan.max_concurrent_captures,
            "Capture concurrency plan"
        );
        Self {
            store,
            admission: AdmissionControl::new(&plan),
            orchestrator: CaptureOrchestrator::new(config.capture.clone()),
            tester,
            finalizer,
            status,
            capture_dir: config.storage.temp_dir.join("captures"),
        }
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    async fn publish(&self, job: &RecordingJob) {
        self.status.write().await.upsert_job(job);
    }

    fn record_outcome(&self, job: &RecordingJob, error: Option<&str>) {
        if let Err(e) = self.store.record_capture_outcome(job.show_id, Utc::now(), error) {
            warn!(show_id = job.show_id, job_id = %job.id, error = %e, "Could not record capture outcome");
        }
    }

    async fn execute(&self, job: &mut RecordingJob, cancel: &CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.capture_dir).await {
            job.fail(&format!("Could not create capture directory: {}", e));
            return;
        }

        let tools = self.tester.tool_order_for(&job.stream_url).await;
        let output = self.capture_dir.join(format!("{}.capture", job.id));

        let report = self
            .orchestrator
            .capture(&job.stream_url, &output, job.duration, &tools, cancel)
            .await;
        job.record_attempts(report.tool_sequence());

        let captured = match report.result {
            Ok(captured) => captured,
            Err(CaptureError::Cancelled) => {
                info!(show_id = job.show_id, job_id = %job.id, "Recording cancelled");
                job.cancel();
                return;
            }
            Err(e) => {
                let msg = e.to_string();
                error!(show_id = job.show_id, job_id = %job.id, error = %msg, "Recording failed");
                job.fail(&msg);
                self.record_outcome(job, Some(&msg));
                self.tester.spawn_retest(&job.stream_url);
                return;
            }
        };

        let request = FinalizeRequest {
            job_id: job.id,
            show_id: job.show_id,
            scheduled_start: job.scheduled_start,
            source_type: job.source_type,
            capture: captured,
        };

        match self.finalizer.finalize(request).await {
            Ok(_) => {
                job.complete();
                self.record_outcome(job, None);
            }
            Err(e) if e.is_benign() => {
                job.complete();
            }
            Err(e @ FinalizeError::QualityValidationFailure { .. }) => {
                let msg = e.to_string();
                warn!(show_id = job.show_id, job_id = %job.id, error = %msg, "Recording rejected");
                job.fail(&msg);
                self.record_outcome(job, Some(&msg));
            }
            Err(e) => {
                let msg = e.to_string();
                error!(show_id = job.show_id, job_id = %job.id, error = %msg, "Finalization failed");
                job.fail(&msg);
                self.record_outcome(job, Some(&msg));
            }
        }
    }
}

#[async_trait]
impl RecordingRunner for JobExecutor {
    async fn run(&self, mut job: RecordingJob, cancel: CancellationToken) -> RecordingJob {
        self.publish(&job).await;

        let Some(_permit) = self.admission.acquire(&cancel).await else {
            job.cancel();
            self.publish(&job).await;
            return job;
        };

        job.start();
        self.publish(&job).await;
        info!(
            show_id = job.show_id,
            job_id = %job.id,
            url = %job.stream_url,
            duration_secs = job.duration.as_secs(),
            source = job.source_type.as_str(),
            "Recording started"
        );

        self.execute(&mut job, &cancel).await;
        self.publish(&job).await;
        job
    }
}
