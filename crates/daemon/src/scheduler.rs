//! Job scheduler for RadioGrab
//!
//! Keeps the live registry of show triggers, diffs it against the store on
//! refresh, and dispatches recording jobs from a cooperative timer loop. The
//! loop only decides what runs and when; every job runs on its own task.

use crate::config::SchedulerConfig;
use crate::job_executor::RecordingRunner;
use crate::jobs::RecordingJob;
use crate::schedule::CronExpr;
use crate::store::{ShowSchedule, SourceType, Store, StoreError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest the timer loop sleeps before re-reading the clock
const MAX_SLEEP: Duration = Duration::from_secs(30);

/// Error type for scheduler operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("Show {show_id} already has a running recording")]
    AlreadyRunning { show_id: i64 },

    #[error("Show {0} not found")]
    UnknownShow(i64),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal state lock poisoned")]
    Poisoned,

    #[error("Store task failed: {0}")]
    Task(String),
}

/// One installed cron airing
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub airing_id: i64,
    pub expr: CronExpr,
    /// Next pending instant; `None` if the expression never fires again
    pub next_fire: Option<DateTime<Utc>>,
}

/// Live scheduling state of one show
#[derive(Debug, Clone, PartialEq)]
pub struct ShowEntry {
    pub stream_url: String,
    pub duration: Duration,
    pub triggers: Vec<Trigger>,
}

/// Outcome of diffing store state against the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: usize,
    pub removed: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Airings whose cron expression failed to parse
    pub skipped: usize,
}

/// A trigger instant that is due
#[derive(Debug, Clone, PartialEq)]
pub struct DueFire {
    pub show_id: i64,
    pub airing_id: i64,
    pub scheduled: DateTime<Utc>,
    pub stream_url: String,
    pub duration: Duration,
}

/// Show id to active triggers, evaluated in one fixed timezone
#[derive(Debug, Clone)]
pub struct Registry {
    tz: Tz,
    shows: BTreeMap<i64, ShowEntry>,
}

impl Registry {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            shows: BTreeMap::new(),
        }
    }

    fn next_fire(&self, expr: &CronExpr, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        expr.next_after(&after.with_timezone(&self.tz))
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn get(&self, show_id: i64) -> Option<&ShowEntry> {
        self.shows.get(&show_id)
    }

    pub fn show_ids(&self) -> Vec<i64> {
        self.shows.keys().copied().collect()
    }

    pub fn trigger_count(&self) -> usize {
        self.shows.values().map(|s| s.triggers.len()).sum()
    }

    /// Diff `schedules` into the registry.
    ///
    /// Unchanged triggers keep their pending instant. Shows absent from
    /// `schedules` or inactive lose all their triggers.
    pub fn apply(&mut self, schedules: &[ShowSchedule], now: DateTime<Utc>) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut next: BTreeMap<i64, ShowEntry> = BTreeMap::new();

        for schedule in schedules.iter().filter(|s| s.active) {
            let mut previous: HashMap<i64, Trigger> = self
                .shows
                .remove(&schedule.show_id)
                .map(|entry| entry.triggers.into_iter().map(|t| (t.airing_id, t)).collect())
                .unwrap_or_default();

            let mut triggers = Vec::with_capacity(schedule.airings.len());
            for airing in schedule.airings.iter().filter(|a| a.active) {
                let expr = match CronExpr::parse(&airing.cron_expression) {
                    Ok(expr) => expr,
                    Err(e) => {
                        warn!(
                            show_id = schedule.show_id,
                            airing_id = airing.id,
                            cron = %airing.cron_expression,
                            error = %e,
                            "Skipping airing with invalid cron expression"
                        );
                        report.skipped += 1;
                        continue;
                    }
                };

                match previous.remove(&airing.id) {
                    Some(existing) if existing.expr == expr => {
                        report.unchanged += 1;
                        triggers.push(existing);
                    }
                    Some(_) => {
                        report.replaced += 1;
                        let next_fire = self.next_fire(&expr, now);
                        triggers.push(Trigger {
                            airing_id: airing.id,
                            expr,
                            next_fire,
                        });
                    }
                    None => {
                        report.added += 1;
                        let next_fire = self.next_fire(&expr, now);
                        triggers.push(Trigger {
                            airing_id: airing.id,
                            expr,
                            next_fire,
                        });
                    }
                }
            }
            report.removed += previous.len();

            if !triggers.is_empty() {
                next.insert(
                    schedule.show_id,
                    ShowEntry {
                        stream_url: schedule.stream_url.clone(),
                        duration: schedule.duration,
                        triggers,
                    },
                );
            }
        }

        report.removed += self.trigger_count();
        self.shows = next;
        report
    }

    /// Take every trigger instant at or before `now`, advancing past `now`.
    ///
    /// Instants older than `misfire_grace` are skipped, and several missed
    /// instants of one trigger collapse into at most one fire.
    pub fn take_due(&mut self, now: DateTime<Utc>, misfire_grace: Duration) -> Vec<DueFire> {
        let tz = self.tz;
        let grace = chrono::Duration::from_std(misfire_grace).unwrap_or(chrono::Duration::zero());
        let mut due = Vec::new();

        for (show_id, entry) in self.shows.iter_mut() {
            for trigger in entry.triggers.iter_mut() {
                let Some(scheduled) = trigger.next_fire else {
                    continue;
                };
                if scheduled > now {
                    continue;
                }

                trigger.next_fire = trigger
                    .expr
                    .next_after(&now.with_timezone(&tz))
                    .map(|dt| dt.with_timezone(&Utc));

                if now - scheduled > grace {
                    warn!(
                        show_id = *show_id,
                        airing_id = trigger.airing_id,
                        scheduled = %scheduled,
                        "Skipping misfired trigger"
                    );
                    continue;
                }

                due.push(DueFire {
                    show_id: *show_id,
                    airing_id: trigger.airing_id,
                    scheduled,
                    stream_url: entry.stream_url.clone(),
                    duration: entry.duration,
                });
            }
        }
        due
    }

    /// Earliest pending instant across all triggers
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.shows
            .values()
            .flat_map(|s| s.triggers.iter())
            .filter_map(|t| t.next_fire)
            .min()
    }
}

struct RunningJob {
    job_id: Uuid,
    cancel: CancellationToken,
}

struct Inner {
    store: Store,
    runner: Arc<dyn RecordingRunner>,
    config: SchedulerConfig,
    registry: Mutex<Registry>,
    running: Mutex<HashMap<i64, RunningJob>>,
    /// Stops the timer loop
    stop: CancellationToken,
    /// Parent of every job's cancellation token
    jobs_cancel: CancellationToken,
    wake: Notify,
    tracker: TaskTracker,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Releases a show's running slot when its job task ends
struct RunningGuard {
    inner: Arc<Inner>,
    show_id: i64,
    job_id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.inner.running.lock() {
            if running.get(&self.show_id).map(|r| r.job_id) == Some(self.job_id) {
                running.remove(&self.show_id);
            }
        }
    }
}

/// Time-triggered dispatcher of recording jobs
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build a scheduler; `stop` ends the timer loop when cancelled
    pub fn new(
        store: Store,
        runner: Arc<dyn RecordingRunner>,
        config: &SchedulerConfig,
        stop: CancellationToken,
    ) -> Result<Self, SchedulerError> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| SchedulerError::InvalidTimezone(config.timezone.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                runner,
                config: config.clone(),
                registry: Mutex::new(Registry::new(tz)),
                running: Mutex::new(HashMap::new()),
                stop,
                jobs_cancel: CancellationToken::new(),
                wake: Notify::new(),
                tracker: TaskTracker::new(),
                loop_handle: Mutex::new(None),
            }),
        })
    }

    /// Load all active schedules and start the timer loop
    pub async fn start(&self) -> Result<RefreshReport, SchedulerError> {
        let report = self.reload().await?;
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.timer_loop().await });
        *self
            .inner
            .loop_handle
            .lock()
            .map_err(|_| SchedulerError::Poisoned)? = Some(handle);
        Ok(report)
    }

    /// Re-read schedule state and diff it into the live registry
    pub async fn refresh(&self) -> Result<RefreshReport, SchedulerError> {
        let report = self.reload().await?;
        self.inner.wake.notify_one();
        Ok(report)
    }

    /// Run a store call on a blocking thread, off the timer loop
    async fn with_store<T, F>(&self, f: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.store.clone();
        let result = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| SchedulerError::Task(e.to_string()))?;
        Ok(result?)
    }

    async fn reload(&self) -> Result<RefreshReport, SchedulerError> {
        let schedules = self.with_store(|store| store.load_schedules()).await?;
        let report = self
            .inner
            .registry
            .lock()
            .map_err(|_| SchedulerError::Poisoned)?
            .apply(&schedules, Utc::now());

        if report.added + report.removed + report.replaced + report.skipped > 0 {
            info!(
                added = report.added,
                removed = report.removed,
                replaced = report.replaced,
                unchanged = report.unchanged,
                skipped = report.skipped,
                "Schedule registry refreshed"
            );
        }
        Ok(report)
    }

    /// Dispatch every trigger due at `now`, one result per fire
    fn fire_due(&self, now: DateTime<Utc>) -> Result<Vec<Result<Uuid, SchedulerError>>, SchedulerError> {
        let misfire_grace = Duration::from_secs(self.inner.config.misfire_grace_secs);
        let due = self
            .inner
            .registry
            .lock()
            .map_err(|_| SchedulerError::Poisoned)?
            .take_due(now, misfire_grace);

        Ok(due
            .into_iter()
            .map(|fire| {
                let result = self.dispatch(
                    fire.show_id,
                    &fire.stream_url,
                    fire.scheduled,
                    fire.duration,
                    SourceType::Scheduled,
                );
                if let Err(e) = &result {
                    warn!(show_id = fire.show_id, airing_id = fire.airing_id, error = %e, "Trigger not dispatched");
                }
                result
            })
            .collect())
    }

    async fn timer_loop(&self) {
        let refresh_every = Duration::from_secs(self.inner.config.refresh_interval_secs.max(1));
        let mut last_refresh = tokio::time::Instant::now();

        loop {
            if let Err(e) = self.fire_due(Utc::now()) {
                warn!(error = %e, "Stopping timer loop");
                return;
            }
            let next_wake = match self.inner.registry.lock() {
                Ok(registry) => registry.next_wake(),
                Err(_) => {
                    warn!("Registry lock poisoned, stopping timer loop");
                    return;
                }
            };

            let until_refresh = refresh_every.saturating_sub(last_refresh.elapsed());
            let until_fire = next_wake
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(MAX_SLEEP);
            let sleep_for = until_fire.min(until_refresh).min(MAX_SLEEP);

            tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }

            if last_refresh.elapsed() >= refresh_every {
                if let Err(e) = self.reload().await {
                    warn!(error = %e, "Schedule refresh failed, retrying next tick");
                }
                last_refresh = tokio::time::Instant::now();
            }
        }
        debug!("Scheduler timer loop stopped");
    }

    fn dispatch(
        &self,
        show_id: i64,
        stream_url: &str,
        scheduled_start: DateTime<Utc>,
        duration: Duration,
        source_type: SourceType,
    ) -> Result<Uuid, SchedulerError> {
        if self.inner.stop.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let job = RecordingJob::new(show_id, stream_url, scheduled_start, duration, source_type);
        let job_id = job.id;
        let cancel = self.inner.jobs_cancel.child_token();

        {
            let mut running = self.inner.running.lock().map_err(|_| SchedulerError::Poisoned)?;
            if running.contains_key(&show_id) {
                return Err(SchedulerError::AlreadyRunning { show_id });
            }
            running.insert(
                show_id,
                RunningJob {
                    job_id,
                    cancel: cancel.clone(),
                },
            );
        }

        let guard = RunningGuard {
            inner: self.inner.clone(),
            show_id,
            job_id,
        };
        let runner = self.inner.runner.clone();
        self.inner.tracker.spawn(async move {
            let _guard = guard;
            let done = runner.run(job, cancel).await;
            debug!(show_id, job_id = %done.id, status = %done.status, "Recording job finished");
        });

        info!(show_id, job_id = %job_id, source = source_type.as_str(), "Recording job dispatched");
        Ok(job_id)
    }

    /// Start a recording for `show_id` immediately
    pub async fn trigger_now(&self, show_id: i64, source_type: SourceType) -> Result<Uuid, SchedulerError> {
        let known = self
            .inner
            .registry
            .lock()
            .map_err(|_| SchedulerError::Poisoned)?
            .get(show_id)
            .map(|entry| (entry.stream_url.clone(), entry.duration));

        let (stream_url, duration) = match known {
            Some(found) => found,
            None => {
                let show = self
                    .with_store(move |store| store.get_show(show_id))
                    .await?
                    .ok_or(SchedulerError::UnknownShow(show_id))?;
                (show.stream_url, show.duration)
            }
        };

        self.dispatch(show_id, &stream_url, Utc::now(), duration, source_type)
    }

    /// Request cancellation of a show's running job; false if none is running
    pub fn cancel(&self, show_id: i64) -> bool {
        match self.inner.running.lock() {
            Ok(running) => match running.get(&show_id) {
                Some(job) => {
                    job.cancel.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Shows with a running job, ascending
    pub fn running_shows(&self) -> Vec<i64> {
        let mut shows: Vec<i64> = self
            .inner
            .running
            .lock()
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default();
        shows.sort_unstable();
        shows
    }

    pub fn registry_snapshot(&self) -> Option<Registry> {
        self.inner.registry.lock().ok().map(|r| r.clone())
    }

    /// Stop the timer loop, let running jobs drain within the grace period,
    /// then cancel the rest.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        let handle = self.inner.loop_handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.tracker.close();
        let grace = Duration::from_secs(self.inner.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            let remaining = self.running_shows();
            warn!(shows = ?remaining, "Shutdown grace elapsed, cancelling running recordings");
            self.inner.jobs_cancel.cancel();
            self.inner.tracker.wait().await;
        }
        info!("Scheduler stopped");
    }
}
