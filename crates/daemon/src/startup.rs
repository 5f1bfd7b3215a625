//! Startup checks module for RadioGrab
//!
//! Preflight probes of the external tools before the daemon starts:
//! at least one capture tool must run, and ffprobe is reported for the
//! finalizer's duration measurement.

use crate::capture::CaptureTool;
use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("No capture tool is available; install streamripper, ffmpeg or wget")]
    NoCaptureTools,
}

/// Which tools answered their version probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReport {
    pub capture_tools: Vec<CaptureTool>,
    pub ffprobe: bool,
}

/// Extract the version token from a tool's version banner.
///
/// Takes the first whitespace-separated token on the first non-empty line
/// that starts with a digit, allowing an `n`/`v` prefix (`n7.0-12-gabc`).
pub fn parse_version_banner(output: &str) -> Option<String> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    line.split_whitespace()
        .map(|tok| tok.trim_end_matches(','))
        .find(|tok| {
            let digits = tok.trim_start_matches(['n', 'v', 'V']);
            digits.chars().next().is_some_and(|c| c.is_ascii_digit())
        })
        .map(String::from)
}

fn version_args(tool: CaptureTool) -> &'static [&'static str] {
    match tool {
        CaptureTool::Streamripper => &["-v"],
        CaptureTool::Ffmpeg => &["-version"],
        CaptureTool::Wget => &["--version"],
    }
}

/// Run `binary args` and return its banner if it exits successfully
fn probe_binary(binary: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(binary).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Some(if stdout.trim().is_empty() {
        stderr.into_owned()
    } else {
        stdout.into_owned()
    })
}

/// Probe every configured tool.
///
/// Fails with `NoCaptureTools` when none of the capture tools runs.
pub fn check_tools(cfg: &Config) -> Result<ToolReport, StartupError> {
    let mut capture_tools = Vec::new();
    for tool in CaptureTool::all() {
        let binary = tool.binary(&cfg.capture);
        match probe_binary(binary, version_args(tool)) {
            Some(banner) => {
                info!(
                    tool = tool.as_str(),
                    binary,
                    version = parse_version_banner(&banner).as_deref().unwrap_or("unknown"),
                    "Capture tool available"
                );
                capture_tools.push(tool);
            }
            None => warn!(tool = tool.as_str(), binary, "Capture tool unavailable"),
        }
    }

    let ffprobe = probe_binary(&cfg.quality.ffprobe_bin, &["-version"]).is_some();
    if !ffprobe {
        warn!(
            binary = %cfg.quality.ffprobe_bin,
            "ffprobe unavailable; recordings will keep their claimed duration"
        );
    }

    if capture_tools.is_empty() {
        return Err(StartupError::NoCaptureTools);
    }
    Ok(ToolReport {
        capture_tools,
        ffprobe,
    })
}
