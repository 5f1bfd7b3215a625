//! RadioGrab recording daemon
//!
//! Orchestration core that turns show schedules into captured, finalized and
//! deduplicated recordings of internet radio streams.

pub mod capture;
pub mod compat;
pub mod concurrency;
pub mod daemon;
pub mod finalize;
pub mod housekeeping;
pub mod job_executor;
pub mod jobs;
pub mod normalize;
pub mod quality_gate;
pub mod schedule;
pub mod scheduler;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod store;

pub use radiograb_config as config;
pub use radiograb_config::Config;
pub use capture::{CaptureError, CaptureOrchestrator, CaptureReport, CaptureTool, CapturedFile};
pub use compat::{
    CaptureToolResult, CompatibilityStatus, CompatibilityTester, StreamCompatibilityRecord,
};
pub use concurrency::{AdmissionControl, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use finalize::{FinalizeError, FinalizeRequest, Finalizer};
pub use housekeeping::{Housekeeper, HousekeepingError, SweepReport};
pub use job_executor::{JobExecutor, RecordingRunner};
pub use jobs::{JobStatus, RecordingJob};
pub use normalize::{AudioNormalizer, FfmpegNormalizer, NormalizeError};
pub use schedule::{
    cron_to_scheduler_weekday, describe, translate_phrase, translate_spec, AiringSpec, CronExpr,
    ScheduleParseError, TranslatedAiring,
};
pub use scheduler::{RefreshReport, Registry, Scheduler, SchedulerError};
pub use startup::{check_tools, StartupError, ToolReport};
pub use status::{new_shared_status, SharedStatus, StatusSnapshot};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use store::{Recording, ShowSchedule, SourceType, Store, StoreError};
