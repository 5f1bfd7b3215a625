//! Daemon startup and main loop for RadioGrab
//!
//! Wires the store, compatibility tester, executor, scheduler, housekeeping
//! and status server together and runs them until a shutdown signal.

use crate::compat::CompatibilityTester;
use crate::config::{Config, ConfigError};
use crate::finalize::Finalizer;
use crate::housekeeping::Housekeeper;
use crate::job_executor::{JobExecutor, RecordingRunner};
use crate::normalize::FfmpegNormalizer;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::startup::{check_tools, StartupError};
use crate::status::{new_shared_status, SharedStatus};
use crate::status_server::{run_status_server, ServerError};
use crate::store::{Store, StoreError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub store: Store,
    /// Shared job status served over HTTP
    pub status: SharedStatus,
    pub tester: CompatibilityTester,
    pub executor: Arc<JobExecutor>,
    pub scheduler: Scheduler,
    pub housekeeper: Housekeeper,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Load configuration from `config_path` (plus environment overrides),
    /// run the tool checks and build the daemon.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::from_config(config)
    }

    /// Build the daemon from an existing configuration, running the tool checks
    pub fn from_config(config: Config) -> Result<Self, DaemonError> {
        check_tools(&config)?;
        Self::new_without_checks(config)
    }

    /// Build the daemon without probing external tools
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(&config.storage.recordings_dir)?;
        std::fs::create_dir_all(&config.storage.temp_dir)?;

        let store = Store::open(&config.storage.database_path)?;
        let shutdown = CancellationToken::new();
        let status = new_shared_status();

        let tester = CompatibilityTester::new(store.clone(), &config, shutdown.clone());
        let normalizer = Arc::new(FfmpegNormalizer::new(&config.capture.ffmpeg_bin, &config.quality));
        let finalizer = Finalizer::new(store.clone(), normalizer, config.quality.clone(), &config.storage);
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            &config,
            tester.clone(),
            finalizer,
            status.clone(),
        ));
        let runner: Arc<dyn RecordingRunner> = executor.clone();
        let scheduler = Scheduler::new(store.clone(), runner, &config.scheduler, shutdown.clone())?;
        let housekeeper = Housekeeper::new(store.clone(), config.housekeeping.clone(), &config.storage)
            .with_status(status.clone());

        Ok(Self {
            config,
            store,
            status,
            tester,
            executor,
            scheduler,
            housekeeper,
            shutdown,
        })
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every background loop until ctrl-c, SIGTERM or the shutdown token.
    pub async fn run_until_shutdown(&self) -> Result<(), DaemonError> {
        let report = self.scheduler.start().await?;
        info!(
            shows = self.scheduler.registry_snapshot().map(|r| r.show_ids().len()).unwrap_or(0),
            triggers = report.added,
            skipped = report.skipped,
            timezone = %self.config.scheduler.timezone,
            "Scheduler started"
        );

        let tracker = TaskTracker::new();

        let housekeeper = self.housekeeper.clone();
        let token = self.shutdown.clone();
        tracker.spawn(async move { housekeeper.run_periodic(token).await });

        let tester = self.tester.clone();
        tracker.spawn(async move { tester.run_health_sweeps().await });

        if self.config.status.enabled {
            let status = self.status.clone();
            let addr = self.config.status.bind_addr.clone();
            let token = self.shutdown.clone();
            tracker.spawn(async move {
                if let Err(e) = run_status_server(status, &addr, token).await {
                    error!(error = %e, "Status server stopped");
                }
            });
        }
        tracker.close();

        wait_for_signal(&self.shutdown).await;
        info!("Shutdown requested");
        self.shutdown.cancel();

        self.scheduler.shutdown().await;
        tracker.wait().await;
        info!("Daemon stopped");
        Ok(())
    }
}

async fn wait_for_signal(shutdown: &CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }
}
