//! Housekeeping module for RadioGrab
//!
//! Periodic resource-bounding sweep: orphaned undersized captures, stale
//! temporary artifacts, and per-show retention of finalized recordings.

use crate::config::{HousekeepingConfig, StorageConfig};
use crate::status::SharedStatus;
use crate::store::{Recording, RetentionPolicy, Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Error type for housekeeping sweeps
#[derive(Debug, Error)]
pub enum HousekeepingError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sweep task failed: {0}")]
    Task(String),
}

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub orphans_removed: usize,
    pub temp_removed: usize,
    pub retention_removed: usize,
    pub bytes_freed: u64,
}

/// A regular file found during a walk
struct FoundFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn walk_files(root: &Path) -> Vec<FoundFile> {
    if !root.exists() {
        return Vec::new();
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            Some(FoundFile {
                path: e.path().to_path_buf(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect()
}

fn age(now: SystemTime, modified: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

/// Recordings of one show that fall outside `policy`, oldest first.
///
/// `recordings` must be ordered oldest first. A zero limit means unbounded.
pub fn expired_recordings<'a>(
    recordings: &'a [Recording],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a Recording> {
    let max_age = policy
        .max_age_days
        .filter(|d| *d > 0)
        .map(|d| chrono::Duration::days(d as i64));
    let excess = policy
        .max_count
        .filter(|c| *c > 0)
        .map(|c| recordings.len().saturating_sub(c as usize))
        .unwrap_or(0);

    recordings
        .iter()
        .enumerate()
        .filter(|(idx, rec)| {
            let too_old = max_age.is_some_and(|limit| {
                DateTime::from_timestamp(rec.scheduled_start, 0)
                    .is_some_and(|start| now - start > limit)
            });
            too_old || *idx < excess
        })
        .map(|(_, rec)| rec)
        .collect()
}

/// Runs housekeeping sweeps
#[derive(Clone)]
pub struct Housekeeper {
    store: Store,
    config: HousekeepingConfig,
    recordings_dir: PathBuf,
    temp_dir: PathBuf,
    status: Option<SharedStatus>,
}

impl Housekeeper {
    pub fn new(store: Store, config: HousekeepingConfig, storage: &StorageConfig) -> Self {
        Self {
            store,
            config,
            recordings_dir: storage.recordings_dir.clone(),
            temp_dir: storage.temp_dir.clone(),
            status: None,
        }
    }

    /// Publish each sweep's report into the status snapshot
    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn default_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: Some(self.config.default_retention_days),
            max_count: self.config.default_retention_max_count,
        }
    }

    /// Run one sweep on a blocking thread
    pub async fn sweep(&self) -> Result<SweepReport, HousekeepingError> {
        let this = self.clone();
        let report = tokio::task::spawn_blocking(move || this.sweep_at(Utc::now()))
            .await
            .map_err(|e| HousekeepingError::Task(e.to_string()))??;

        if let Some(status) = &self.status {
            status.write().await.record_sweep(report);
        }
        Ok(report)
    }

    /// One full sweep evaluated at `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, HousekeepingError> {
        let mut report = SweepReport::default();
        self.enforce_retention(now, &mut report)?;

        let known = self.store.recording_paths()?;
        let now_sys = SystemTime::from(now);
        self.remove_orphans(now_sys, &known, &mut report);
        self.remove_stale_temp(now_sys, &known, &mut report);

        if report != SweepReport::default() {
            info!(
                orphans_removed = report.orphans_removed,
                temp_removed = report.temp_removed,
                retention_removed = report.retention_removed,
                bytes_freed = report.bytes_freed,
                "Housekeeping sweep finished"
            );
        }
        Ok(report)
    }

    fn enforce_retention(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), StoreError> {
        for (show_id, policy) in self.store.retention_policies()? {
            let policy = policy.unwrap_or_else(|| self.default_policy());
            let recordings = self.store.list_recordings(show_id)?;

            for rec in expired_recordings(&recordings, &policy, now) {
                let size = std::fs::metadata(&rec.file_path).map(|m| m.len()).unwrap_or(0);
                match std::fs::remove_file(&rec.file_path) {
                    Ok(()) => report.bytes_freed += size,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(recording_id = rec.id, path = %rec.file_path.display(), error = %e, "Could not delete expired recording");
                        continue;
                    }
                }
                self.store.delete_recording(rec.id)?;
                report.retention_removed += 1;
                debug!(show_id, recording_id = rec.id, "Recording removed by retention policy");
            }
        }
        Ok(())
    }

    fn remove_orphans(&self, now: SystemTime, known: &HashSet<PathBuf>, report: &mut SweepReport) {
        let min_age = Duration::from_secs(self.config.orphan_min_age_secs);
        for root in [&self.recordings_dir, &self.temp_dir] {
            for file in walk_files(root) {
                if file.size >= self.config.min_valid_bytes
                    || known.contains(&file.path)
                    || age(now, file.modified) < min_age
                {
                    continue;
                }
                if remove(&file) {
                    report.orphans_removed += 1;
                    report.bytes_freed += file.size;
                }
            }
        }
    }

    fn remove_stale_temp(&self, now: SystemTime, known: &HashSet<PathBuf>, report: &mut SweepReport) {
        let retention = Duration::from_secs(self.config.temp_retention_hours * 3600);
        for file in walk_files(&self.temp_dir) {
            if known.contains(&file.path) || age(now, file.modified) < retention {
                continue;
            }
            if remove(&file) {
                report.temp_removed += 1;
                report.bytes_freed += file.size;
            }
        }
    }

    /// Sweep on the configured period until `shutdown`
    pub async fn run_periodic(&self, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Housekeeping sweep failed");
                    }
                }
            }
        }
    }
}

fn remove(file: &FoundFile) -> bool {
    match std::fs::remove_file(&file.path) {
        Ok(()) => {
            debug!(path = %file.path.display(), bytes = file.size, "Removed file");
            true
        }
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %file.path.display(), error = %e, "Could not remove file");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewRecording, NewShow, SourceType};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Store,
        housekeeper: Housekeeper,
    }

    fn fixture(config: HousekeepingConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let storage = StorageConfig {
            database_path: dir.path().join("db.sqlite"),
            recordings_dir: dir.path().join("recordings"),
            temp_dir: dir.path().join("tmp"),
        };
        std::fs::create_dir_all(&storage.recordings_dir).unwrap();
        std::fs::create_dir_all(&storage.temp_dir).unwrap();
        let housekeeper = Housekeeper::new(store.clone(), config, &storage);
        Fixture {
            dir,
            store,
            housekeeper,
        }
    }

    fn write(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![1u8; len]).unwrap();
    }

    fn add_show(store: &Store, retention: Option<RetentionPolicy>) -> i64 {
        store
            .insert_show(&NewShow {
                name: "Weekend Mix".to_string(),
                stream_url: "http://radio.example/mix".to_string(),
                duration: Duration::from_secs(3600),
                retention,
            })
            .unwrap()
    }

    fn add_recording(fx: &Fixture, show_id: i64, start: DateTime<Utc>) -> PathBuf {
        let path = fx
            .dir
            .path()
            .join(format!("recordings/{}/{}.mp3", show_id, start.timestamp()));
        write(&path, 500_000);
        fx.store
            .insert_recording(&NewRecording {
                show_id,
                file_path: path.clone(),
                recorded_at: start,
                scheduled_start: start.timestamp(),
                duration_secs: 3600.0,
                size_bytes: 500_000,
                source_type: SourceType::Scheduled,
                quality_valid: true,
            })
            .unwrap();
        path
    }

    fn rec(id: i64, start: DateTime<Utc>) -> Recording {
        Recording {
            id,
            show_id: 1,
            file_path: PathBuf::from(format!("/r/{}.mp3", id)),
            recorded_at: start,
            scheduled_start: start.timestamp(),
            duration_secs: 60.0,
            size_bytes: 1,
            source_type: SourceType::Scheduled,
            quality_valid: true,
        }
    }

    #[test]
    fn test_expired_by_age_and_count() {
        let now = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let recs: Vec<Recording> = (0..5)
            .map(|i| rec(i, now - chrono::Duration::days(40 - i * 10)))
            .collect();

        let by_age = expired_recordings(
            &recs,
            &RetentionPolicy {
                max_age_days: Some(30),
                max_count: None,
            },
            now,
        );
        assert_eq!(by_age.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0]);

        let by_count = expired_recordings(
            &recs,
            &RetentionPolicy {
                max_age_days: None,
                max_count: Some(2),
            },
            now,
        );
        assert_eq!(by_count.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1, 2]);

        let unbounded = expired_recordings(
            &recs,
            &RetentionPolicy {
                max_age_days: Some(0),
                max_count: Some(0),
            },
            now,
        );
        assert!(unbounded.is_empty());
    }

    #[test]
    fn test_orphan_undersized_capture_removed() {
        let fx = fixture(HousekeepingConfig::default());
        let tiny = fx.dir.path().join("tmp/captures/job.capture");
        write(&tiny, 8_192);
        let big = fx.dir.path().join("tmp/captures/other.capture");
        write(&big, 200_000);

        // Too young to touch
        let report = fx.housekeeper.sweep_at(Utc::now()).unwrap();
        assert_eq!(report.orphans_removed, 0);
        assert!(tiny.exists());

        let later = Utc::now() + chrono::Duration::minutes(10);
        let report = fx.housekeeper.sweep_at(later).unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.bytes_freed, 8_192);
        assert!(!tiny.exists());
        assert!(big.exists());
    }

    #[test]
    fn test_stale_temp_removed() {
        let fx = fixture(HousekeepingConfig::default());
        let probe = fx.dir.path().join("tmp/compat/x.probe");
        write(&probe, 300_000);

        let report = fx
            .housekeeper
            .sweep_at(Utc::now() + chrono::Duration::hours(25))
            .unwrap();
        assert_eq!(report.temp_removed, 1);
        assert!(!probe.exists());
    }

    #[test]
    fn test_retention_removes_oldest_beyond_count() {
        let fx = fixture(HousekeepingConfig::default());
        let show_id = add_show(
            &fx.store,
            Some(RetentionPolicy {
                max_age_days: None,
                max_count: Some(2),
            }),
        );
        let now = Utc::now();
        let oldest = add_recording(&fx, show_id, now - chrono::Duration::days(3));
        let middle = add_recording(&fx, show_id, now - chrono::Duration::days(2));
        let newest = add_recording(&fx, show_id, now - chrono::Duration::days(1));

        let report = fx.housekeeper.sweep_at(now).unwrap();
        assert_eq!(report.retention_removed, 1);
        assert_eq!(report.orphans_removed, 0);
        assert!(!oldest.exists());
        assert!(middle.exists() && newest.exists());
        assert_eq!(fx.store.list_recordings(show_id).unwrap().len(), 2);
    }

    #[test]
    fn test_default_retention_applies() {
        let fx = fixture(HousekeepingConfig {
            default_retention_days: 7,
            ..HousekeepingConfig::default()
        });
        let show_id = add_show(&fx.store, None);
        let now = Utc::now();
        add_recording(&fx, show_id, now - chrono::Duration::days(10));
        add_recording(&fx, show_id, now - chrono::Duration::days(1));

        let report = fx.housekeeper.sweep_at(now).unwrap();
        assert_eq!(report.retention_removed, 1);
        assert_eq!(fx.store.list_recordings(show_id).unwrap().len(), 1);
    }

    #[test]
    fn test_committed_small_recording_is_not_orphan() {
        let fx = fixture(HousekeepingConfig {
            min_valid_bytes: 1_000_000,
            ..HousekeepingConfig::default()
        });
        let show_id = add_show(&fx.store, None);
        let path = add_recording(&fx, show_id, Utc::now());

        let report = fx
            .housekeeper
            .sweep_at(Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(report.orphans_removed, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_sweep_publishes_status() {
        let status = crate::status::new_shared_status();
        let fx = fixture(HousekeepingConfig::default());
        let housekeeper = fx.housekeeper.clone().with_status(status.clone());
        housekeeper.sweep().await.unwrap();
        assert_eq!(status.read().await.last_sweep, Some(SweepReport::default()));
    }
}
