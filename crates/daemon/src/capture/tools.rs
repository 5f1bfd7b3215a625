//! Capture tool definitions
//!
//! Builds and runs the command line for each supported capture tool and
//! classifies how the process ended.

use super::CaptureError;
use crate::config::CaptureConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines of stdout/stderr kept for diagnostics
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// How often a running tool's output file is checked
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a terminated tool gets to exit before it is killed
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Stderr fragments that mean the stream itself could not be reached
const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "could not resolve",
    "name or service not known",
    "404",
    "no route to host",
    "network is unreachable",
];

/// Supported external capture tools, a closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureTool {
    Streamripper,
    Ffmpeg,
    Wget,
}

impl CaptureTool {
    /// Every tool, in fixed test order
    pub fn all() -> [CaptureTool; 3] {
        [CaptureTool::Streamripper, CaptureTool::Ffmpeg, CaptureTool::Wget]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureTool::Streamripper => "streamripper",
            CaptureTool::Ffmpeg => "ffmpeg",
            CaptureTool::Wget => "wget",
        }
    }

    /// Small fixed score bonus reflecting known reliability, used for tie-breaks
    pub fn reliability_bonus(&self) -> u32 {
        match self {
            CaptureTool::Ffmpeg => 3,
            CaptureTool::Streamripper => 2,
            CaptureTool::Wget => 1,
        }
    }

    /// Whether the tool stops by itself once the target duration is reached
    ///
    /// wget downloads until the stream ends; it is stopped at the target
    /// duration and that stop counts as a normal completion.
    pub fn self_limiting(&self) -> bool {
        !matches!(self, CaptureTool::Wget)
    }

    /// Configured binary name or path for this tool
    pub fn binary<'a>(&self, cfg: &'a CaptureConfig) -> &'a str {
        match self {
            CaptureTool::Streamripper => &cfg.streamripper_bin,
            CaptureTool::Ffmpeg => &cfg.ffmpeg_bin,
            CaptureTool::Wget => &cfg.wget_bin,
        }
    }

    /// Build the command that saves `url` to `output` for `duration`
    pub fn build_command(&self, binary: &str, url: &str, output: &Path, duration: Duration) -> Command {
        let mut cmd = Command::new(binary);
        let secs = duration.as_secs().max(1).to_string();

        match self {
            CaptureTool::Streamripper => {
                cmd.arg(url);
                cmd.arg("-a").arg(output);
                cmd.arg("-s");
                cmd.arg("-l").arg(&secs);
                cmd.arg("--quiet");
            }
            CaptureTool::Ffmpeg => {
                cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]);
                cmd.args(["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]);
                cmd.arg("-i").arg(url);
                cmd.arg("-t").arg(&secs);
                // Stream copy into a container that holds mp3, aac, opus and vorbis alike
                cmd.args(["-vn", "-c:a", "copy", "-f", "matroska"]);
                cmd.arg(output);
            }
            CaptureTool::Wget => {
                cmd.args(["-q", "--tries=1", "--timeout=15"]);
                cmd.arg("-O").arg(output);
                cmd.arg(url);
            }
        }
        cmd
    }

    /// Run one capture attempt and classify the result
    pub async fn capture(
        &self,
        binary: &str,
        request: &CaptureRequest,
        limits: &CaptureLimits,
        cancel: &CancellationToken,
    ) -> ToolAttempt {
        let started = Instant::now();
        let mut attempt = ToolAttempt {
            tool: *self,
            outcome: AttemptOutcome::Failed(CaptureError::Cancelled),
            bytes: 0,
            elapsed: Duration::ZERO,
            exit_code: None,
            diagnostics: String::new(),
        };

        remove_capture_file(&request.output).await;
        if let Some(parent) = request.output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                attempt.outcome = AttemptOutcome::Failed(CaptureError::Io(e));
                return attempt;
            }
        }

        let mut cmd = self.build_command(binary, &request.url, &request.output, request.duration);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                attempt.outcome = AttemptOutcome::Failed(CaptureError::ToolUnavailable { tool: *self });
                return attempt;
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                attempt.outcome = AttemptOutcome::Failed(CaptureError::ToolUnavailable { tool: *self });
                return attempt;
            }
            Err(e) => {
                attempt.outcome = AttemptOutcome::Failed(CaptureError::Io(e));
                return attempt;
            }
        };

        let stdout_tail = child.stdout.take().map(spawn_tail_reader);
        let stderr_tail = child.stderr.take().map(spawn_tail_reader);

        let end = self.supervise(&mut child, request, limits, cancel, started).await;

        attempt.elapsed = started.elapsed();
        attempt.bytes = file_size(&request.output).await;

        let stdout = collect_tail(stdout_tail).await;
        let stderr = collect_tail(stderr_tail).await;
        attempt.diagnostics = format_diagnostics(&stdout, &stderr);
        debug!(
            tool = self.as_str(),
            url = %request.url,
            bytes = attempt.bytes,
            elapsed_secs = attempt.elapsed.as_secs_f64(),
            diagnostics = %attempt.diagnostics,
            "Capture tool finished"
        );

        attempt.outcome = match end {
            SupervisedEnd::Exited(status) => {
                attempt.exit_code = status.code();
                self.classify_exit(status, attempt.bytes, attempt.elapsed, request.duration, limits, &stderr)
            }
            SupervisedEnd::StoppedAtDuration => AttemptOutcome::StoppedAtDuration,
            SupervisedEnd::HardTimeout if attempt.bytes > 0 => AttemptOutcome::TimedOut,
            SupervisedEnd::HardTimeout => AttemptOutcome::Failed(CaptureError::Timeout { tool: *self }),
            SupervisedEnd::NoAudio => AttemptOutcome::Failed(CaptureError::NoAudio { tool: *self }),
            SupervisedEnd::Cancelled => AttemptOutcome::Failed(CaptureError::Cancelled),
            SupervisedEnd::WaitFailed(e) => AttemptOutcome::Failed(CaptureError::Io(e)),
        };
        attempt
    }

    /// Watch a running tool until it exits or one of the limits fires
    async fn supervise(
        &self,
        child: &mut Child,
        request: &CaptureRequest,
        limits: &CaptureLimits,
        cancel: &CancellationToken,
        started: Instant,
    ) -> SupervisedEnd {
        let hard_deadline = started + request.duration + limits.timeout_grace;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => SupervisedEnd::Exited(status),
                        Err(e) => SupervisedEnd::WaitFailed(e),
                    };
                }
                _ = cancel.cancelled() => {
                    terminate(child).await;
                    return SupervisedEnd::Cancelled;
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    if Instant::now() >= hard_deadline {
                        terminate(child).await;
                        return SupervisedEnd::HardTimeout;
                    }
                    if !self.self_limiting() && elapsed >= request.duration {
                        terminate(child).await;
                        return SupervisedEnd::StoppedAtDuration;
                    }
                    if elapsed >= limits.early_failure_window && file_size(&request.output).await == 0 {
                        terminate(child).await;
                        return SupervisedEnd::NoAudio;
                    }
                }
            }
        }
    }

    fn classify_exit(
        &self,
        status: ExitStatus,
        bytes: u64,
        elapsed: Duration,
        target: Duration,
        limits: &CaptureLimits,
        stderr: &str,
    ) -> AttemptOutcome {
        if status.success() {
            return if bytes > 0 {
                AttemptOutcome::Completed
            } else {
                AttemptOutcome::Failed(CaptureError::NoAudio { tool: *self })
            };
        }

        // Some tools exit non-zero when the stream closes at the end of the window
        if bytes > 0 && elapsed + limits.timeout_grace >= target {
            return AttemptOutcome::Completed;
        }

        // Audio recorded past the early-failure window is kept for the quality gate
        if bytes > 0 && elapsed > limits.early_failure_window {
            return AttemptOutcome::Interrupted {
                code: status.code(),
                detail: last_line(stderr),
            };
        }

        let lower = stderr.to_lowercase();
        let detail = last_line(stderr);
        if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            AttemptOutcome::Failed(CaptureError::StreamUnreachable { tool: *self, detail })
        } else {
            AttemptOutcome::Failed(CaptureError::ToolFailed {
                tool: *self,
                code: status.code(),
                detail,
            })
        }
    }
}

impl fmt::Display for CaptureTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamripper" => Ok(CaptureTool::Streamripper),
            "ffmpeg" => Ok(CaptureTool::Ffmpeg),
            "wget" => Ok(CaptureTool::Wget),
            other => Err(format!("unknown capture tool '{}'", other)),
        }
    }
}

/// What to capture and where
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub url: String,
    pub output: PathBuf,
    pub duration: Duration,
}

/// Time limits applied to every attempt
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    /// Extra time past the target duration before the tool is killed
    pub timeout_grace: Duration,
    /// A tool with an empty output file after this long is abandoned
    pub early_failure_window: Duration,
}

impl CaptureLimits {
    pub fn from_config(cfg: &CaptureConfig) -> Self {
        Self {
            timeout_grace: Duration::from_secs(cfg.timeout_grace_secs),
            early_failure_window: Duration::from_secs(cfg.early_failure_window_secs),
        }
    }
}

/// How one attempt ended
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Tool exited by itself with audio written
    Completed,
    /// Non-self-limiting tool stopped at the target duration
    StoppedAtDuration,
    /// Hard timeout hit after audio was written
    TimedOut,
    /// Tool failed mid-broadcast after the early-failure window, with audio written
    Interrupted { code: Option<i32>, detail: String },
    Failed(CaptureError),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, AttemptOutcome::Failed(_))
    }
}

/// Result of running one tool once
#[derive(Debug)]
pub struct ToolAttempt {
    pub tool: CaptureTool,
    pub outcome: AttemptOutcome,
    pub bytes: u64,
    pub elapsed: Duration,
    pub exit_code: Option<i32>,
    /// Last lines of stdout and stderr
    pub diagnostics: String,
}

enum SupervisedEnd {
    Exited(ExitStatus),
    StoppedAtDuration,
    HardTimeout,
    NoAudio,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// SIGTERM, a short wait, then SIGKILL
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(id) = child.id() {
            let _ = signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM);
            if tokio::time::timeout(TERMINATE_WAIT, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

fn spawn_tail_reader<R>(reader: R) -> JoinHandle<VecDeque<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == DIAGNOSTIC_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    })
}

async fn collect_tail(handle: Option<JoinHandle<VecDeque<String>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    // A grandchild may keep the pipe open after the tool itself is gone
    match tokio::time::timeout(TERMINATE_WAIT, handle).await {
        Ok(Ok(tail)) => tail.into_iter().collect::<Vec<_>>().join("\n"),
        _ => String::new(),
    }
}

fn format_diagnostics(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => format!("stdout:\n{}", stdout),
        (true, false) => format!("stderr:\n{}", stderr),
        (false, false) => format!("stdout:\n{}\nstderr:\n{}", stdout, stderr),
    }
}

fn last_line(text: &str) -> String {
    text.lines().last().unwrap_or("").trim().to_string()
}

/// Remove a capture output file; a missing file is not an error
pub(crate) async fn remove_capture_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove capture file");
        }
    }
}

pub(crate) async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|a| a.to_str().map(String::from))
            .collect()
    }

    fn limits(grace: u64, early: u64) -> CaptureLimits {
        CaptureLimits {
            timeout_grace: Duration::from_secs(grace),
            early_failure_window: Duration::from_secs(early),
        }
    }

    fn request(dir: &TempDir, secs: u64) -> CaptureRequest {
        CaptureRequest {
            url: "http://radio.example/stream".to_string(),
            output: dir.path().join("capture.raw"),
            duration: Duration::from_secs(secs),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_commands_carry_url_output_and_duration(
            secs in 1u64..20_000,
            name in "[a-z0-9_]{1,20}",
        ) {
            let output = PathBuf::from(format!("/tmp/{}.raw", name));
            let url = format!("http://stream.example/{}", name);
            let duration = Duration::from_secs(secs);

            let ffmpeg = args_of(&CaptureTool::Ffmpeg.build_command("ffmpeg", &url, &output, duration));
            prop_assert_eq!(ffmpeg.last().map(String::as_str), output.to_str());
            prop_assert!(ffmpeg.windows(2).any(|w| w[0] == "-i" && w[1] == url));
            prop_assert!(ffmpeg.windows(2).any(|w| w[0] == "-t" && w[1] == secs.to_string()));

            let sr = args_of(&CaptureTool::Streamripper.build_command("streamripper", &url, &output, duration));
            prop_assert_eq!(&sr[0], &url);
            prop_assert!(sr.windows(2).any(|w| w[0] == "-a" && Some(w[1].as_str()) == output.to_str()));
            prop_assert!(sr.windows(2).any(|w| w[0] == "-l" && w[1] == secs.to_string()));

            let wget = args_of(&CaptureTool::Wget.build_command("wget", &url, &output, duration));
            prop_assert_eq!(wget.last(), Some(&url));
            prop_assert!(wget.windows(2).any(|w| w[0] == "-O" && Some(w[1].as_str()) == output.to_str()));
        }
    }

    #[test]
    fn test_tool_order_and_bonus() {
        assert_eq!(
            CaptureTool::all(),
            [CaptureTool::Streamripper, CaptureTool::Ffmpeg, CaptureTool::Wget]
        );
        assert!(CaptureTool::Ffmpeg.reliability_bonus() > CaptureTool::Streamripper.reliability_bonus());
        assert!(!CaptureTool::Wget.self_limiting());
        assert_eq!("wget".parse::<CaptureTool>(), Ok(CaptureTool::Wget));
        assert!("vlc".parse::<CaptureTool>().is_err());
    }

    #[tokio::test]
    async fn test_successful_capture() {
        let dir = TempDir::new().unwrap();
        let bin = fake_tool(dir.path(), "ffmpeg", &writes_bytes(4096));
        let attempt = CaptureTool::Ffmpeg
            .capture(bin.to_str().unwrap(), &request(&dir, 5), &limits(5, 3), &CancellationToken::new())
            .await;

        assert!(matches!(attempt.outcome, AttemptOutcome::Completed), "{:?}", attempt.outcome);
        assert_eq!(attempt.bytes, 4096);
        assert_eq!(attempt.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable_with_diagnostics() {
        let dir = TempDir::new().unwrap();
        let bin = fake_tool(dir.path(), "streamripper", REFUSED);
        let attempt = CaptureTool::Streamripper
            .capture(bin.to_str().unwrap(), &request(&dir, 5), &limits(5, 3), &CancellationToken::new())
            .await;

        assert!(matches!(
            attempt.outcome,
            AttemptOutcome::Failed(CaptureError::StreamUnreachable { .. })
        ));
        assert_eq!(attempt.exit_code, Some(1));
        assert!(attempt.diagnostics.contains("Connection refused"));
        assert!(attempt.elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_unavailable() {
        let dir = TempDir::new().unwrap();
        let attempt = CaptureTool::Ffmpeg
            .capture(
                "/nonexistent/radiograb-ffmpeg",
                &request(&dir, 5),
                &limits(5, 3),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            attempt.outcome,
            AttemptOutcome::Failed(CaptureError::ToolUnavailable { tool: CaptureTool::Ffmpeg })
        ));
    }

    #[tokio::test]
    async fn test_silent_tool_fails_early() {
        let dir = TempDir::new().unwrap();
        let bin = fake_tool(dir.path(), "ffmpeg", "exec sleep 30");
        let attempt = CaptureTool::Ffmpeg
            .capture(bin.to_str().unwrap(), &request(&dir, 20), &limits(5, 1), &CancellationToken::new())
            .await;

        assert!(matches!(
            attempt.outcome,
            AttemptOutcome::Failed(CaptureError::NoAudio { .. })
        ));
        assert!(attempt.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wget_is_stopped_at_duration() {
        let dir = TempDir::new().unwrap();
        let bin = fake_tool(dir.path(), "wget", &format!("{}\nexec sleep 30", writes_bytes(2048)));
        let attempt = CaptureTool::Wget
            .capture(bin.to_str().unwrap(), &request(&dir, 1), &limits(10, 5), &CancellationToken::new())
            .await;

        assert!(matches!(attempt.outcome, AttemptOutcome::StoppedAtDuration));
        assert_eq!(attempt.bytes, 2048);
        assert!(attempt.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_hard_timeout_keeps_written_audio() {
        let dir = TempDir::new().unwrap();
        let bin = fake_tool(dir.path(), "ffmpeg", &format!("{}\nexec sleep 30", writes_bytes(2048)));
        let attempt = CaptureTool::Ffmpeg
            .capture(bin.to_str().unwrap(), &request(&dir, 1), &limits(1, 5), &CancellationToken::new())
            .await;

        assert!(matches!(attempt.outcome, AttemptOutcome::TimedOut));
        assert_eq!(attempt.bytes, 2048);
    }

    #[tokio::test]
    async fn test_late_failure_keeps_recorded_audio() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "{}\nsleep 3\necho \"Connection reset by peer\" >&2\nexit 1",
            writes_bytes(300 * 1024)
        );
        let bin = fake_tool(dir.path(), "ffmpeg", &body);
        let attempt = CaptureTool::Ffmpeg
            .capture(bin.to_str().unwrap(), &request(&dir, 20), &limits(2, 2), &CancellationToken::new())
            .await;

        match &attempt.outcome {
            AttemptOutcome::Interrupted { code, detail } => {
                assert_eq!(*code, Some(1));
                assert!(detail.contains("Connection reset"));
            }
            other => panic!("expected interrupted capture, got {:?}", other),
        }
        assert!(attempt.outcome.is_success());
        assert_eq!(attempt.bytes, 300 * 1024);
    }

    #[tokio::test]
    async fn test_early_failure_with_audio_still_falls_back() {
        let dir = TempDir::new().unwrap();
        let body = format!("{}\nexit 1", writes_bytes(512));
        let bin = fake_tool(dir.path(), "ffmpeg", &body);
        let attempt = CaptureTool::Ffmpeg
            .capture(bin.to_str().unwrap(), &request(&dir, 20), &limits(2, 5), &CancellationToken::new())
            .await;

        assert!(matches!(
            attempt.outcome,
            AttemptOutcome::Failed(CaptureError::ToolFailed { code: Some(1), .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_capture_file_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.raw");
        remove_capture_file(&path).await;

        std::fs::write(&path, b"abc").unwrap();
        remove_capture_file(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cancel_terminates_tool() {
        let dir = TempDir::new().unwrap();
        let bin = fake_tool(dir.path(), "ffmpeg", &format!("{}\nexec sleep 30", writes_bytes(2048)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let attempt = CaptureTool::Ffmpeg
            .capture(bin.to_str().unwrap(), &request(&dir, 30), &limits(5, 5), &cancel)
            .await;
        assert!(matches!(attempt.outcome, AttemptOutcome::Failed(CaptureError::Cancelled)));
        assert!(attempt.elapsed < Duration::from_secs(5));
    }
}
