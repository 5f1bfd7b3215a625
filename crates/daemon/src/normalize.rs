//! Audio normalization module for RadioGrab
//!
//! Transcodes captures to the canonical delivery format and measures the
//! duration of the decoded audio with ffprobe.

use crate::config::QualityConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error type for normalization operations.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// ffmpeg exited unsuccessfully.
    #[error("ffmpeg transcode failed: {0}")]
    TranscodeFailed(String),

    /// ffprobe exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// Blocking task panicked or was cancelled.
    #[error("Normalization task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalized audio written to the requested path
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAudio {
    pub path: PathBuf,
    /// Duration of the decoded audio
    pub duration_secs: f64,
}

/// Converts captures to the delivery format and measures real duration
#[async_trait]
pub trait AudioNormalizer: Send + Sync {
    /// Transcode `input` into `output` and measure the result
    async fn normalize(&self, input: &Path, output: &Path) -> Result<NormalizedAudio, NormalizeError>;

    /// Decoded duration of an existing file
    async fn measure_duration(&self, path: &Path) -> Result<f64, NormalizeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Extract the audio duration from `ffprobe -print_format json` output.
///
/// Prefers the first audio stream's duration and falls back to the container's.
pub fn parse_ffprobe_duration(json_str: &str) -> Result<f64, NormalizeError> {
    let probe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| NormalizeError::ParseError(e.to_string()))?;

    let stream_duration = probe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.duration)
        .and_then(|d| d.parse::<f64>().ok());

    let format_duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());

    stream_duration
        .or(format_duration)
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| NormalizeError::ParseError("no duration in ffprobe output".to_string()))
}

/// Audio codec and muxer for a delivery extension
fn output_format(extension: &str) -> (&'static str, &'static str) {
    match extension.to_lowercase().as_str() {
        "ogg" => ("libvorbis", "ogg"),
        "opus" => ("libopus", "ogg"),
        "m4a" => ("aac", "ipod"),
        "aac" => ("aac", "adts"),
        _ => ("libmp3lame", "mp3"),
    }
}

/// ffmpeg/ffprobe backed normalizer
#[derive(Debug, Clone)]
pub struct FfmpegNormalizer {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    bitrate: String,
    extension: String,
}

impl FfmpegNormalizer {
    pub fn new(ffmpeg_bin: &str, quality: &QualityConfig) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.to_string(),
            ffprobe_bin: quality.ffprobe_bin.clone(),
            bitrate: quality.output_bitrate.clone(),
            extension: quality.output_extension.clone(),
        }
    }

    /// Build the transcode command; the muxer is explicit since `output` may be a staging name
    pub fn build_transcode_command(&self, input: &Path, output: &Path) -> Command {
        let (codec, muxer) = output_format(&self.extension);
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]);
        cmd.arg("-i").arg(input);
        cmd.args(["-vn", "-map", "0:a:0"]);
        cmd.arg("-c:a").arg(codec);
        cmd.arg("-b:a").arg(&self.bitrate);
        cmd.arg("-f").arg(muxer);
        cmd.arg(output);
        cmd
    }

    fn transcode(&self, input: &Path, output: &Path) -> Result<(), NormalizeError> {
        let out = self.build_transcode_command(input, output).output()?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(NormalizeError::TranscodeFailed(format!(
                "exit status {}: {}",
                out.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn probe_duration(&self, path: &Path) -> Result<f64, NormalizeError> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NormalizeError::ProbeFailed(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        parse_ffprobe_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl AudioNormalizer for FfmpegNormalizer {
    async fn normalize(&self, input: &Path, output: &Path) -> Result<NormalizedAudio, NormalizeError> {
        let this = self.clone();
        let input = input.to_path_buf();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || {
            this.transcode(&input, &output)?;
            let duration_secs = this.probe_duration(&output)?;
            Ok(NormalizedAudio {
                path: output,
                duration_secs,
            })
        })
        .await
        .map_err(|e| NormalizeError::Task(e.to_string()))?
    }

    async fn measure_duration(&self, path: &Path) -> Result<f64, NormalizeError> {
        let this = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || this.probe_duration(&path))
            .await
            .map_err(|e| NormalizeError::Task(e.to_string()))?
    }
}
