//! Stream capture module for RadioGrab
//!
//! The closed set of external capture tools and the orchestrator that drives
//! them with fallback, early-failure detection and hard timeouts.

mod orchestrator;
mod tools;

pub use orchestrator::{CaptureOrchestrator, CaptureReport, CapturedFile};
pub use tools::{AttemptOutcome, CaptureLimits, CaptureRequest, CaptureTool, ToolAttempt};
pub(crate) use tools::remove_capture_file;

#[cfg(test)]
pub(crate) use tools::test_support;

use thiserror::Error;

/// Error type for capture operations
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The tool binary could not be launched
    #[error("{tool} is not installed or not executable")]
    ToolUnavailable { tool: CaptureTool },

    #[error("{tool} could not reach the stream: {detail}")]
    StreamUnreachable { tool: CaptureTool, detail: String },

    #[error("{tool} exited with code {code:?}: {detail}")]
    ToolFailed {
        tool: CaptureTool,
        code: Option<i32>,
        detail: String,
    },

    /// Nothing was written within the early-failure window
    #[error("{tool} produced no audio")]
    NoAudio { tool: CaptureTool },

    /// Hard timeout reached without any audio written
    #[error("{tool} timed out without producing audio")]
    Timeout { tool: CaptureTool },

    #[error("Capture cancelled")]
    Cancelled,

    #[error("All capture tools failed after {attempts} attempts; last error: {last_error}")]
    Exhausted { attempts: usize, last_error: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Whether the orchestrator should move on to the next tool.
    ///
    /// A tool that fails after the early-failure window with audio written
    /// reports `AttemptOutcome::Interrupted` instead, so it never reaches here.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            CaptureError::ToolUnavailable { .. }
                | CaptureError::StreamUnreachable { .. }
                | CaptureError::ToolFailed { .. }
                | CaptureError::NoAudio { .. }
                | CaptureError::Io(_)
        )
    }
}
