//! Stream compatibility module for RadioGrab
//!
//! Probes a stream with every capture tool, scores each attempt, and keeps a
//! per-stream verdict with a recommended tool.

use crate::capture::{CaptureLimits, CaptureRequest, CaptureTool};
use crate::config::{CaptureConfig, CompatibilityConfig, Config};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Base points for a tool that exits successfully with audio
const SCORE_SUCCESS: u32 = 50;
/// Bonus when at least half of the expected bytes arrived
const SCORE_THROUGHPUT: u32 = 30;
/// Bonus when the tool finished within the test window plus slack
const SCORE_NO_HANG: u32 = 15;
const HANG_SLACK: Duration = Duration::from_secs(2);

/// Overall verdict for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityStatus {
    /// Two or more tools succeeded
    Excellent,
    /// Exactly one tool succeeded
    Good,
    Failed,
    /// Never tested
    Unknown,
}

impl CompatibilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityStatus::Excellent => "excellent",
            CompatibilityStatus::Good => "good",
            CompatibilityStatus::Failed => "failed",
            CompatibilityStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for CompatibilityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "excellent" => Ok(CompatibilityStatus::Excellent),
            "good" => Ok(CompatibilityStatus::Good),
            "failed" => Ok(CompatibilityStatus::Failed),
            "unknown" => Ok(CompatibilityStatus::Unknown),
            other => Err(format!("unknown compatibility status '{}'", other)),
        }
    }
}

/// Scored outcome of probing a stream with one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureToolResult {
    pub tool: CaptureTool,
    pub success: bool,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub score: u32,
    pub error: Option<String>,
}

impl CaptureToolResult {
    pub fn failed(tool: CaptureTool, elapsed_secs: f64, error: &str) -> Self {
        Self {
            tool,
            success: false,
            bytes: 0,
            elapsed_secs,
            score: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Stored verdict for one stream URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCompatibilityRecord {
    pub stream_url: String,
    pub tested_at: DateTime<Utc>,
    pub status: CompatibilityStatus,
    /// Always a tool whose result in `results` has `success == true`
    pub recommended_tool: Option<CaptureTool>,
    pub results: Vec<CaptureToolResult>,
}

impl StreamCompatibilityRecord {
    /// Build a record from per-tool results, deriving status and recommendation
    pub fn from_results(
        stream_url: &str,
        tested_at: DateTime<Utc>,
        results: Vec<CaptureToolResult>,
    ) -> Self {
        Self {
            stream_url: stream_url.to_string(),
            tested_at,
            status: overall_status(&results),
            recommended_tool: recommend(&results),
            results,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.tested_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 >= ttl.as_secs()
    }

    /// Joined tool errors, for the show's last_error field
    pub fn error_summary(&self) -> Option<String> {
        if self.status != CompatibilityStatus::Failed {
            return None;
        }
        let errors: Vec<String> = self
            .results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.tool, e)))
            .collect();
        if errors.is_empty() {
            Some("no capture tool succeeded".to_string())
        } else {
            Some(errors.join("; "))
        }
    }
}

/// Inputs to scoring that come from configuration
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    pub assumed_bitrate_kbps: u32,
    pub test_window: Duration,
}

impl ScoringParams {
    /// Bytes a stream at the assumed bitrate delivers over the test window
    pub fn expected_bytes(&self) -> u64 {
        self.assumed_bitrate_kbps as u64 * 1000 / 8 * self.test_window.as_secs()
    }
}

/// Deterministic score of one probe; unsuccessful probes score zero
pub fn score_attempt(
    tool: CaptureTool,
    success: bool,
    bytes: u64,
    elapsed: Duration,
    params: &ScoringParams,
) -> u32 {
    if !success || bytes == 0 {
        return 0;
    }
    let mut score = SCORE_SUCCESS;
    if bytes * 2 >= params.expected_bytes() {
        score += SCORE_THROUGHPUT;
    }
    if elapsed <= params.test_window + HANG_SLACK {
        score += SCORE_NO_HANG;
    }
    score + tool.reliability_bonus()
}

pub fn overall_status(results: &[CaptureToolResult]) -> CompatibilityStatus {
    if results.is_empty() {
        return CompatibilityStatus::Unknown;
    }
    match results.iter().filter(|r| r.success).count() {
        0 => CompatibilityStatus::Failed,
        1 => CompatibilityStatus::Good,
        _ => CompatibilityStatus::Excellent,
    }
}

fn test_position(tool: CaptureTool) -> usize {
    CaptureTool::all()
        .iter()
        .position(|t| *t == tool)
        .unwrap_or(usize::MAX)
}

/// Highest-scoring successful tool; ties go to the reliability bonus, then test order
pub fn recommend(results: &[CaptureToolResult]) -> Option<CaptureTool> {
    results
        .iter()
        .filter(|r| r.success)
        .max_by(|a, b| {
            a.score
                .cmp(&b.score)
                .then(a.tool.reliability_bonus().cmp(&b.tool.reliability_bonus()))
                .then(test_position(b.tool).cmp(&test_position(a.tool)))
        })
        .map(|r| r.tool)
}

/// `first` followed by the remaining tools in test order
fn order_with_first(first: CaptureTool) -> Vec<CaptureTool> {
    let mut order = vec![first];
    order.extend(CaptureTool::all().into_iter().filter(|t| *t != first));
    order
}

/// Runs compatibility probes and keeps their results in the store
#[derive(Clone)]
pub struct CompatibilityTester {
    store: Store,
    capture: CaptureConfig,
    compat: CompatibilityConfig,
    probe_dir: PathBuf,
    shutdown: CancellationToken,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CompatibilityTester {
    pub fn new(store: Store, config: &Config, shutdown: CancellationToken) -> Self {
        Self {
            store,
            capture: config.capture.clone(),
            compat: config.compatibility.clone(),
            probe_dir: config.storage.temp_dir.join("compat"),
            shutdown,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.compat.ttl_hours * 3600)
    }

    fn scoring(&self, window: Duration) -> ScoringParams {
        ScoringParams {
            assumed_bitrate_kbps: self.compat.assumed_bitrate_kbps,
            test_window: window,
        }
    }

    /// Single short probe with one tool, for immediate feedback
    pub async fn quick_test(&self, url: &str) -> CaptureToolResult {
        let tool = match self.store.get_compatibility(url) {
            Ok(Some(record)) => record.recommended_tool.unwrap_or(CaptureTool::Ffmpeg),
            _ => CaptureTool::Ffmpeg,
        };
        let window = Duration::from_secs(self.compat.quick_test_secs.max(1));
        probe(
            tool,
            url.to_string(),
            self.capture.clone(),
            self.scoring(window),
            self.probe_dir.clone(),
            self.shutdown.child_token(),
        )
        .await
    }

    /// Probe the stream with every tool concurrently and build a record
    pub async fn comprehensive_test(&self, url: &str) -> StreamCompatibilityRecord {
        let window = Duration::from_secs(self.compat.test_window_secs.max(1));
        let mut set = JoinSet::new();
        for tool in CaptureTool::all() {
            set.spawn(probe(
                tool,
                url.to_string(),
                self.capture.clone(),
                self.scoring(window),
                self.probe_dir.clone(),
                self.shutdown.child_token(),
            ));
        }

        let mut results = Vec::with_capacity(3);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(url, error = %e, "Compatibility probe task failed"),
            }
        }
        results.sort_by_key(|r| test_position(r.tool));

        let record = StreamCompatibilityRecord::from_results(url, Utc::now(), results);
        info!(
            url,
            status = record.status.as_str(),
            recommended = record.recommended_tool.map(|t| t.as_str()),
            "Compatibility test finished"
        );
        record
    }

    /// Run a comprehensive test and persist it
    pub async fn test_and_store(&self, url: &str) -> Result<StreamCompatibilityRecord, StoreError> {
        let record = self.comprehensive_test(url).await;
        self.store.save_compatibility(&record)?;
        Ok(record)
    }

    /// Tool order for a capture of `url`.
    ///
    /// A fresh, non-failed record puts its recommended tool first. A missing or
    /// stale record triggers a fresh probe when configured to.
    pub async fn tool_order_for(&self, url: &str) -> Vec<CaptureTool> {
        let now = Utc::now();
        let existing = match self.store.get_compatibility(url) {
            Ok(record) => record,
            Err(e) => {
                warn!(url, error = %e, "Could not read compatibility record");
                return CaptureTool::all().to_vec();
            }
        };

        let record = match existing {
            Some(record) if !record.is_stale(now, self.ttl()) => Some(record),
            stale_or_missing if self.capture.probe_when_unknown => {
                match self.test_and_store(url).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(url, error = %e, "Could not store compatibility record");
                        stale_or_missing
                    }
                }
            }
            stale => stale,
        };

        match record.and_then(|r| r.recommended_tool) {
            Some(tool) => order_with_first(tool),
            None => CaptureTool::all().to_vec(),
        }
    }

    /// Re-test a stream in the background after a capture failed outright
    pub fn spawn_retest(&self, url: &str) -> Option<tokio::task::JoinHandle<()>> {
        {
            let Ok(mut in_flight) = self.in_flight.lock() else {
                return None;
            };
            if !in_flight.insert(url.to_string()) {
                return None;
            }
        }

        let tester = self.clone();
        let url = url.to_string();
        Some(tokio::spawn(async move {
            if let Err(e) = tester.test_and_store(&url).await {
                warn!(url = %url, error = %e, "On-demand compatibility re-test failed");
            }
            if let Ok(mut in_flight) = tester.in_flight.lock() {
                in_flight.remove(&url);
            }
        }))
    }

    /// Re-test every active stream whose record is missing, stale or failed
    pub async fn health_sweep(&self) -> Result<usize, StoreError> {
        let urls = self.store.streams_needing_retest(Utc::now(), self.ttl())?;
        let mut tested = 0;
        for url in urls {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.test_and_store(&url).await {
                Ok(_) => tested += 1,
                Err(e) => warn!(url = %url, error = %e, "Health sweep could not store result"),
            }
        }
        Ok(tested)
    }

    /// Run health sweeps on the configured period until shutdown
    pub async fn run_health_sweeps(&self) {
        let period = Duration::from_secs(self.compat.health_sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.health_sweep().await {
                        Ok(0) => {}
                        Ok(n) => info!(streams = n, "Health sweep re-tested streams"),
                        Err(e) => warn!(error = %e, "Health sweep failed"),
                    }
                }
            }
        }
    }
}

/// Probe one tool into its own scratch file, which is removed afterwards
async fn probe(
    tool: CaptureTool,
    url: String,
    capture: CaptureConfig,
    scoring: ScoringParams,
    probe_dir: PathBuf,
    cancel: CancellationToken,
) -> CaptureToolResult {
    let output = probe_dir.join(format!("{}_{}.probe", uuid::Uuid::new_v4(), tool.as_str()));
    let request = CaptureRequest {
        url,
        output: output.clone(),
        duration: scoring.test_window,
    };
    let limits = CaptureLimits {
        timeout_grace: Duration::from_secs(capture.timeout_grace_secs),
        early_failure_window: Duration::from_secs(capture.early_failure_window_secs)
            .min(scoring.test_window),
    };

    let attempt = tool
        .capture(tool.binary(&capture), &request, &limits, &cancel)
        .await;
    crate::capture::remove_capture_file(&output).await;

    let success = attempt.outcome.is_success() && attempt.bytes > 0;
    let error = match &attempt.outcome {
        crate::capture::AttemptOutcome::Failed(e) => Some(e.to_string()),
        _ => None,
    };
    CaptureToolResult {
        tool,
        success,
        bytes: attempt.bytes,
        elapsed_secs: attempt.elapsed.as_secs_f64(),
        score: score_attempt(tool, success, attempt.bytes, attempt.elapsed, &scoring),
        error,
    }
}
