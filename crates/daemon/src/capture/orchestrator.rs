//! Capture orchestrator
//!
//! Drives one capture through an ordered tool list, falling back on early
//! failure and stopping the chain on timeout or cancellation.

use super::tools::{
    remove_capture_file, AttemptOutcome, CaptureLimits, CaptureRequest, CaptureTool, ToolAttempt,
};
use super::CaptureError;
use crate::config::CaptureConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A capture that produced audio, ready for the finalizer
#[derive(Debug, Clone)]
pub struct CapturedFile {
    pub path: PathBuf,
    pub tool: CaptureTool,
    pub bytes: u64,
    pub elapsed: Duration,
    /// The duration the tool was asked to record
    pub claimed_duration: Duration,
    /// True when the hard timeout had to stop the tool
    pub timed_out: bool,
}

/// Every attempt made plus the overall result
#[derive(Debug)]
pub struct CaptureReport {
    pub attempts: Vec<ToolAttempt>,
    pub result: Result<CapturedFile, CaptureError>,
}

impl CaptureReport {
    /// Tools tried, in order
    pub fn tool_sequence(&self) -> Vec<CaptureTool> {
        self.attempts.iter().map(|a| a.tool).collect()
    }
}

/// Runs capture tools with fallback
#[derive(Debug, Clone)]
pub struct CaptureOrchestrator {
    config: CaptureConfig,
    limits: CaptureLimits,
}

impl CaptureOrchestrator {
    pub fn new(config: CaptureConfig) -> Self {
        let limits = CaptureLimits::from_config(&config);
        Self { config, limits }
    }

    /// Capture `url` into `output` for `duration`, trying `tools` in order.
    ///
    /// Failures that allow fallback are logged and absorbed until the list is
    /// exhausted. A hard timeout with no audio or a cancellation ends the chain.
    pub async fn capture(
        &self,
        url: &str,
        output: &Path,
        duration: Duration,
        tools: &[CaptureTool],
        cancel: &CancellationToken,
    ) -> CaptureReport {
        let mut attempts: Vec<ToolAttempt> = Vec::with_capacity(tools.len());
        let request = CaptureRequest {
            url: url.to_string(),
            output: output.to_path_buf(),
            duration,
        };

        for tool in tools {
            if cancel.is_cancelled() {
                return CaptureReport {
                    attempts,
                    result: Err(CaptureError::Cancelled),
                };
            }

            let binary = tool.binary(&self.config);
            let attempt = tool.capture(binary, &request, &self.limits, cancel).await;

            match &attempt.outcome {
                outcome if outcome.is_success() => {
                    if let AttemptOutcome::Interrupted { code, detail } = outcome {
                        warn!(
                            tool = tool.as_str(),
                            url,
                            exit_code = ?code,
                            detail = %detail,
                            bytes = attempt.bytes,
                            elapsed_secs = attempt.elapsed.as_secs_f64(),
                            "Capture interrupted mid-broadcast, keeping recorded audio"
                        );
                    }
                    let captured = CapturedFile {
                        path: request.output.clone(),
                        tool: *tool,
                        bytes: attempt.bytes,
                        elapsed: attempt.elapsed,
                        claimed_duration: duration,
                        timed_out: matches!(outcome, AttemptOutcome::TimedOut),
                    };
                    info!(
                        tool = tool.as_str(),
                        url,
                        bytes = attempt.bytes,
                        elapsed_secs = attempt.elapsed.as_secs_f64(),
                        "Capture succeeded"
                    );
                    attempts.push(attempt);
                    return CaptureReport {
                        attempts,
                        result: Ok(captured),
                    };
                }
                AttemptOutcome::Failed(e) if e.allows_fallback() => {
                    warn!(
                        tool = tool.as_str(),
                        url,
                        error = %e,
                        elapsed_secs = attempt.elapsed.as_secs_f64(),
                        "Capture tool failed, falling back"
                    );
                    remove_capture_file(&request.output).await;
                    attempts.push(attempt);
                }
                _ => {
                    remove_capture_file(&request.output).await;
                    let result = match &attempt.outcome {
                        AttemptOutcome::Failed(CaptureError::Timeout { tool }) => {
                            let tool = *tool;
                            error!(tool = tool.as_str(), url, "Capture timed out without audio");
                            CaptureError::Timeout { tool }
                        }
                        AttemptOutcome::Failed(CaptureError::Cancelled) => CaptureError::Cancelled,
                        other => {
                            error!(tool = tool.as_str(), url, outcome = ?other, "Capture chain stopped");
                            CaptureError::Exhausted {
                                attempts: attempts.len() + 1,
                                last_error: format!("{:?}", other),
                            }
                        }
                    };
                    attempts.push(attempt);
                    return CaptureReport {
                        attempts,
                        result: Err(result),
                    };
                }
            }
        }

        let last_error = attempts
            .last()
            .and_then(|a| match &a.outcome {
                AttemptOutcome::Failed(e) => Some(e.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "no capture tools configured".to_string());
        error!(url, attempts = attempts.len(), last_error = %last_error, "All capture tools failed");

        let attempt_count = attempts.len();
        CaptureReport {
            attempts,
            result: Err(CaptureError::Exhausted {
                attempts: attempt_count,
                last_error,
            }),
        }
    }
}
