//! Recording finalizer for RadioGrab
//!
//! Turns a raw capture into a committed [`Recording`] exactly once per
//! (show, rounded scheduled start): byte-rate gate, normalization, duration
//! recomputation, conflict-aware insert, and the move into the library.

use crate::capture::CapturedFile;
use crate::config::{QualityConfig, StorageConfig};
use crate::normalize::{AudioNormalizer, NormalizeError};
use crate::quality_gate::{check_byte_rate, duration_is_valid, QualityGateResult};
use crate::store::{NewRecording, Recording, SourceType, Store, StoreError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Error type for finalization
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(
        "Capture rejected: {bytes} bytes over {duration_secs:.0}s is {bytes_per_sec:.1} B/s (minimum {min_bytes_per_sec} B/s)"
    )]
    QualityValidationFailure {
        bytes: u64,
        duration_secs: f64,
        bytes_per_sec: f64,
        min_bytes_per_sec: u64,
    },

    /// A recording already exists for this slot
    #[error("Recording for show {show_id} at {scheduled_start} already exists")]
    DuplicateRecordingDetected { show_id: i64, scheduled_start: i64 },

    #[error("Store stayed busy after retry: {0}")]
    PersistenceConflict(String),

    #[error("Normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl FinalizeError {
    /// Duplicates leave the job Completed
    pub fn is_benign(&self) -> bool {
        matches!(self, FinalizeError::DuplicateRecordingDetected { .. })
    }
}

/// Round a start instant to the nearest whole minute, in unix seconds
pub fn round_scheduled_start(start: DateTime<Utc>) -> i64 {
    (start.timestamp() + 30).div_euclid(60) * 60
}

/// Library path of a finalized recording
pub fn final_path(recordings_dir: &Path, show_id: i64, scheduled_start: i64, extension: &str) -> PathBuf {
    let stamp = DateTime::from_timestamp(scheduled_start, 0)
        .unwrap_or_default()
        .format("%Y%m%d_%H%M");
    recordings_dir
        .join(show_id.to_string())
        .join(format!("{}_{}.{}", show_id, stamp, extension))
}

/// One capture to finalize
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub job_id: Uuid,
    pub show_id: i64,
    pub scheduled_start: DateTime<Utc>,
    pub source_type: SourceType,
    pub capture: CapturedFile,
}

/// Validates, normalizes and commits captures
#[derive(Clone)]
pub struct Finalizer {
    store: Store,
    normalizer: Arc<dyn AudioNormalizer>,
    quality: QualityConfig,
    recordings_dir: PathBuf,
    staging_dir: PathBuf,
}

impl Finalizer {
    pub fn new(
        store: Store,
        normalizer: Arc<dyn AudioNormalizer>,
        quality: QualityConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            store,
            normalizer,
            quality,
            recordings_dir: storage.recordings_dir.clone(),
            staging_dir: storage.temp_dir.join("finalize"),
        }
    }

    /// Finalize a capture into a recording row and library file.
    ///
    /// The raw capture is consumed on every path except an I/O failure
    /// before the gate.
    pub async fn finalize(&self, req: FinalizeRequest) -> Result<Recording, FinalizeError> {
        let scheduled_start = round_scheduled_start(req.scheduled_start);
        let raw = &req.capture.path;

        if self.store.recording_exists(req.show_id, scheduled_start)? {
            info!(show_id = req.show_id, scheduled_start, job_id = %req.job_id, "Duplicate recording, discarding capture");
            remove_quietly(raw).await;
            return Err(FinalizeError::DuplicateRecordingDetected {
                show_id: req.show_id,
                scheduled_start,
            });
        }

        // A missing file counts as empty so a rerun is still rejected
        let bytes = match tokio::fs::metadata(raw).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let claimed_secs = req.capture.claimed_duration.as_secs_f64();

        if let QualityGateResult::Reject {
            bytes,
            duration_secs,
            bytes_per_sec,
            min_bytes_per_sec,
        } = check_byte_rate(bytes, claimed_secs, self.quality.min_bytes_per_sec)
        {
            warn!(
                show_id = req.show_id,
                job_id = %req.job_id,
                bytes,
                bytes_per_sec,
                "Capture failed quality gate, discarding"
            );
            remove_quietly(raw).await;
            return Err(FinalizeError::QualityValidationFailure {
                bytes,
                duration_secs,
                bytes_per_sec,
                min_bytes_per_sec,
            });
        }

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staging = self
            .staging_dir
            .join(format!("{}.{}.part", req.job_id, self.quality.output_extension));

        let (duration_secs, quality_valid) = self.prepare_staging(&req, &staging, claimed_secs).await?;
        remove_quietly(raw).await;

        let size_bytes = match tokio::fs::metadata(&staging).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(e.into());
            }
        };

        let destination = final_path(
            &self.recordings_dir,
            req.show_id,
            scheduled_start,
            &self.quality.output_extension,
        );
        let new_rec = NewRecording {
            show_id: req.show_id,
            file_path: destination.clone(),
            recorded_at: Utc::now(),
            scheduled_start,
            duration_secs,
            size_bytes,
            source_type: req.source_type,
            quality_valid,
        };

        let id = match self.insert_with_retry(&new_rec).await {
            Ok(id) => id,
            Err(StoreError::Conflict(_)) => {
                info!(show_id = req.show_id, scheduled_start, job_id = %req.job_id, "Lost insert race, discarding duplicate");
                remove_quietly(&staging).await;
                return Err(FinalizeError::DuplicateRecordingDetected {
                    show_id: req.show_id,
                    scheduled_start,
                });
            }
            Err(StoreError::Busy) => {
                remove_quietly(&staging).await;
                return Err(FinalizeError::PersistenceConflict(format!(
                    "insert of show {} at {}",
                    req.show_id, scheduled_start
                )));
            }
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(e.into());
            }
        };

        if let Err(e) = move_into_place(&staging, &destination).await {
            warn!(recording_id = id, error = %e, "Failed to move recording into place, rolling back row");
            if let Err(rollback) = self.store.delete_recording(id) {
                error!(
                    recording_id = id,
                    show_id = req.show_id,
                    path = %destination.display(),
                    error = %rollback,
                    "Could not roll back recording row; it points at a missing file"
                );
            }
            remove_quietly(&staging).await;
            return Err(e.into());
        }

        info!(
            recording_id = id,
            show_id = req.show_id,
            job_id = %req.job_id,
            duration_secs,
            size_bytes,
            quality_valid,
            path = %destination.display(),
            "Recording finalized"
        );

        Ok(Recording {
            id,
            show_id: new_rec.show_id,
            file_path: new_rec.file_path,
            recorded_at: new_rec.recorded_at,
            scheduled_start,
            duration_secs,
            size_bytes,
            source_type: new_rec.source_type,
            quality_valid,
        })
    }

    /// Fill `staging` with the delivery file; returns (duration, quality_valid)
    async fn prepare_staging(
        &self,
        req: &FinalizeRequest,
        staging: &Path,
        claimed_secs: f64,
    ) -> Result<(f64, bool), FinalizeError> {
        let raw = &req.capture.path;
        let ratio = self.quality.min_duration_ratio;

        if self.quality.normalize {
            match self.normalizer.normalize(raw, staging).await {
                Ok(audio) => {
                    let valid = duration_is_valid(audio.duration_secs, claimed_secs, ratio);
                    return Ok((audio.duration_secs, valid));
                }
                Err(e) => {
                    warn!(
                        show_id = req.show_id,
                        job_id = %req.job_id,
                        error = %e,
                        "Normalization failed, delivering raw capture"
                    );
                    remove_quietly(staging).await;
                    tokio::fs::copy(raw, staging).await?;
                    return Ok((claimed_secs, false));
                }
            }
        }

        tokio::fs::copy(raw, staging).await?;
        match self.normalizer.measure_duration(staging).await {
            Ok(decoded) => Ok((decoded, duration_is_valid(decoded, claimed_secs, ratio))),
            Err(e) => {
                debug!(job_id = %req.job_id, error = %e, "Could not measure raw capture duration");
                Ok((claimed_secs, false))
            }
        }
    }

    async fn insert_with_retry(&self, rec: &NewRecording) -> Result<i64, StoreError> {
        match self.store.insert_recording(rec) {
            Err(StoreError::Busy) => {
                debug!(show_id = rec.show_id, "Store busy, retrying insert once");
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
                self.store.insert_recording(rec)
            }
            other => other,
        }
    }
}

async fn move_into_place(staging: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(staging, destination).await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureTool;
    use crate::normalize::NormalizedAudio;
    use crate::store::NewShow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    /// Writes a small output file and reports a fixed decoded duration
    struct FakeNormalizer {
        duration_secs: Option<f64>,
    }

    #[async_trait]
    impl AudioNormalizer for FakeNormalizer {
        async fn normalize(&self, _input: &Path, output: &Path) -> Result<NormalizedAudio, NormalizeError> {
            tokio::task::yield_now().await;
            let duration_secs = self
                .duration_secs
                .ok_or_else(|| NormalizeError::TranscodeFailed("fake failure".to_string()))?;
            tokio::fs::write(output, vec![0u8; 4096]).await?;
            Ok(NormalizedAudio {
                path: output.to_path_buf(),
                duration_secs,
            })
        }

        async fn measure_duration(&self, _path: &Path) -> Result<f64, NormalizeError> {
            self.duration_secs
                .ok_or_else(|| NormalizeError::ProbeFailed("fake failure".to_string()))
        }
    }

    struct Fixture {
        dir: TempDir,
        store: Store,
        show_id: i64,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Store::open_in_memory().unwrap();
            let show_id = store
                .insert_show(&NewShow {
                    name: "Evening Jazz".to_string(),
                    stream_url: "http://radio.example/jazz".to_string(),
                    duration: Duration::from_secs(3600),
                    retention: None,
                })
                .unwrap();
            Self { dir, store, show_id }
        }

        fn finalizer(&self, duration_secs: Option<f64>) -> Finalizer {
            let storage = StorageConfig {
                database_path: self.dir.path().join("db.sqlite"),
                recordings_dir: self.dir.path().join("recordings"),
                temp_dir: self.dir.path().join("tmp"),
            };
            Finalizer::new(
                self.store.clone(),
                Arc::new(FakeNormalizer { duration_secs }),
                QualityConfig::default(),
                &storage,
            )
        }

        /// Sparse raw capture of `len` bytes
        fn capture(&self, name: &str, len: u64) -> CapturedFile {
            let path = self.dir.path().join(name);
            let file = std::fs::File::create(&path).unwrap();
            file.set_len(len).unwrap();
            CapturedFile {
                path,
                tool: CaptureTool::Ffmpeg,
                bytes: len,
                elapsed: Duration::from_secs(3600),
                claimed_duration: Duration::from_secs(3600),
                timed_out: false,
            }
        }

        fn request(&self, capture: CapturedFile) -> FinalizeRequest {
            FinalizeRequest {
                job_id: Uuid::new_v4(),
                show_id: self.show_id,
                scheduled_start: Utc.with_ymd_and_hms(2024, 3, 5, 19, 0, 4).unwrap(),
                source_type: SourceType::Scheduled,
                capture,
            }
        }
    }

    #[test]
    fn test_round_scheduled_start() {
        let t = |h, m, s| Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap();
        assert_eq!(round_scheduled_start(t(19, 0, 4)), t(19, 0, 0).timestamp());
        assert_eq!(round_scheduled_start(t(18, 59, 45)), t(19, 0, 0).timestamp());
        assert_eq!(round_scheduled_start(t(19, 0, 29)), t(19, 0, 0).timestamp());
        assert_eq!(round_scheduled_start(t(19, 0, 30)), t(19, 1, 0).timestamp());
    }

    #[test]
    fn test_final_path_layout() {
        let start = Utc.with_ymd_and_hms(2024, 3, 5, 19, 0, 0).unwrap().timestamp();
        assert_eq!(
            final_path(Path::new("/srv/rec"), 7, start, "mp3"),
            PathBuf::from("/srv/rec/7/7_20240305_1900.mp3")
        );
    }

    #[tokio::test]
    async fn test_accepts_full_hour_capture() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(Some(3600.0));
        let capture = fx.capture("raw.capture", 45_000_000);
        let raw_path = capture.path.clone();

        let rec = finalizer.finalize(fx.request(capture)).await.unwrap();
        assert_eq!(rec.duration_secs, 3600.0);
        assert_eq!(rec.source_type, SourceType::Scheduled);
        assert!(rec.quality_valid);
        assert!(rec.file_path.exists());
        assert!(!raw_path.exists());
        assert_eq!(fx.store.list_recordings(fx.show_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_undersized_capture_idempotently() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(Some(3600.0));

        let capture = fx.capture("tiny.capture", 8_192);
        let err = finalizer.finalize(fx.request(capture.clone())).await.unwrap_err();
        assert!(matches!(err, FinalizeError::QualityValidationFailure { .. }));
        assert!(!capture.path.exists());

        let err = finalizer.finalize(fx.request(capture)).await.unwrap_err();
        assert!(matches!(err, FinalizeError::QualityValidationFailure { .. }));
        assert!(fx.store.list_recordings(fx.show_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_decoded_duration_is_not_quality_valid() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(Some(900.0));
        let rec = finalizer
            .finalize(fx.request(fx.capture("raw.capture", 45_000_000)))
            .await
            .unwrap();
        assert_eq!(rec.duration_secs, 900.0);
        assert!(!rec.quality_valid);
    }

    #[tokio::test]
    async fn test_normalize_failure_delivers_raw() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(None);
        let rec = finalizer
            .finalize(fx.request(fx.capture("raw.capture", 10_000_000)))
            .await
            .unwrap();
        assert_eq!(rec.duration_secs, 3600.0);
        assert_eq!(rec.size_bytes, 10_000_000);
        assert!(!rec.quality_valid);
    }

    #[tokio::test]
    async fn test_second_finalization_is_duplicate() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(Some(3600.0));
        finalizer
            .finalize(fx.request(fx.capture("a.capture", 45_000_000)))
            .await
            .unwrap();

        let second = fx.capture("b.capture", 45_000_000);
        let err = finalizer.finalize(fx.request(second.clone())).await.unwrap_err();
        assert!(err.is_benign());
        assert!(!second.path.exists());
        assert_eq!(fx.store.list_recordings(fx.show_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_move_rolls_back_row() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(Some(3600.0));
        // A plain file where the show's directory should be
        std::fs::create_dir_all(fx.dir.path().join("recordings")).unwrap();
        std::fs::write(fx.dir.path().join("recordings").join(fx.show_id.to_string()), b"x").unwrap();

        let err = finalizer
            .finalize(fx.request(fx.capture("raw.capture", 45_000_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizeError::Io(_)));
        assert!(fx.store.list_recordings(fx.show_id).unwrap().is_empty());

        let leftovers = std::fs::read_dir(fx.dir.path().join("tmp/finalize"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_finalization_yields_one_row() {
        let fx = Fixture::new();
        let finalizer = fx.finalizer(Some(3600.0));
        let a = fx.request(fx.capture("a.capture", 45_000_000));
        let b = fx.request(fx.capture("b.capture", 45_000_000));

        let (ra, rb) = tokio::join!(finalizer.finalize(a), finalizer.finalize(b));
        let outcomes = [ra, rb];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(FinalizeError::is_benign));
        assert_eq!(fx.store.list_recordings(fx.show_id).unwrap().len(), 1);

        let leftovers = std::fs::read_dir(fx.dir.path().join("tmp/finalize"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }
}
