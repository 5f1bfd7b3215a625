//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Where the daemon keeps its database, finished recordings and scratch files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// SQLite database holding shows, airings, compatibility records and recordings
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Root directory for finalized recordings (one subdirectory per show)
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
    /// Scratch directory for in-progress captures and probe files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("radiograb.db")
}

fn default_recordings_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/radiograb")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            recordings_dir: default_recordings_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// IANA timezone all cron expressions are evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// How often the registry is re-read from the store
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// A trigger whose instant is older than this when noticed is skipped instead of fired
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    /// How long shutdown waits for in-flight jobs before cancelling them
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_misfire_grace_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            refresh_interval_secs: default_refresh_interval_secs(),
            misfire_grace_secs: default_misfire_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Capture orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Maximum concurrent captures (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_captures: u32,
    /// Extra wall-clock time granted past the target duration before a tool is killed
    #[serde(default = "default_timeout_grace_secs")]
    pub timeout_grace_secs: u64,
    /// A tool that has written nothing after this window is abandoned for the next one
    #[serde(default = "default_early_failure_window_secs")]
    pub early_failure_window_secs: u64,
    /// Run a comprehensive compatibility test before capturing a stream with no usable record
    #[serde(default = "default_probe_when_unknown")]
    pub probe_when_unknown: bool,
    #[serde(default = "default_streamripper_bin")]
    pub streamripper_bin: String,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default = "default_wget_bin")]
    pub wget_bin: String,
}

fn default_timeout_grace_secs() -> u64 {
    10
}

fn default_early_failure_window_secs() -> u64 {
    5
}

fn default_probe_when_unknown() -> bool {
    true
}

fn default_streamripper_bin() -> String {
    "streamripper".to_string()
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}

fn default_wget_bin() -> String {
    "wget".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_concurrent_captures: 0,
            timeout_grace_secs: default_timeout_grace_secs(),
            early_failure_window_secs: default_early_failure_window_secs(),
            probe_when_unknown: default_probe_when_unknown(),
            streamripper_bin: default_streamripper_bin(),
            ffmpeg_bin: default_ffmpeg_bin(),
            wget_bin: default_wget_bin(),
        }
    }
}

/// Stream compatibility tester configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompatibilityConfig {
    /// Bitrate assumed when computing the expected byte count of a probe
    #[serde(default = "default_assumed_bitrate_kbps")]
    pub assumed_bitrate_kbps: u32,
    /// Capture window of each tool in a comprehensive test
    #[serde(default = "default_test_window_secs")]
    pub test_window_secs: u64,
    /// Capture window of a quick single-tool test
    #[serde(default = "default_quick_test_secs")]
    pub quick_test_secs: u64,
    /// Age after which a compatibility record is considered stale
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    /// Period of the health sweep that re-tests stale or failed streams
    #[serde(default = "default_health_sweep_interval_secs")]
    pub health_sweep_interval_secs: u64,
}

fn default_assumed_bitrate_kbps() -> u32 {
    128
}

fn default_test_window_secs() -> u64 {
    10
}

fn default_quick_test_secs() -> u64 {
    3
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_health_sweep_interval_secs() -> u64 {
    3600
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        Self {
            assumed_bitrate_kbps: default_assumed_bitrate_kbps(),
            test_window_secs: default_test_window_secs(),
            quick_test_secs: default_quick_test_secs(),
            ttl_hours: default_ttl_hours(),
            health_sweep_interval_secs: default_health_sweep_interval_secs(),
        }
    }
}

/// Recording finalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityConfig {
    /// Captures below this many bytes per second of claimed duration are rejected
    #[serde(default = "default_min_bytes_per_sec")]
    pub min_bytes_per_sec: u64,
    /// Decoded duration must reach this fraction of the claimed duration for quality_valid
    #[serde(default = "default_min_duration_ratio")]
    pub min_duration_ratio: f32,
    /// Transcode captures to the canonical delivery format
    #[serde(default = "default_normalize")]
    pub normalize: bool,
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    #[serde(default = "default_output_bitrate")]
    pub output_bitrate: String,
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: String,
}

fn default_min_bytes_per_sec() -> u64 {
    2048
}

fn default_min_duration_ratio() -> f32 {
    0.5
}

fn default_normalize() -> bool {
    true
}

fn default_output_extension() -> String {
    "mp3".to_string()
}

fn default_output_bitrate() -> String {
    "128k".to_string()
}

fn default_ffprobe_bin() -> String {
    "ffprobe".to_string()
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_bytes_per_sec: default_min_bytes_per_sec(),
            min_duration_ratio: default_min_duration_ratio(),
            normalize: default_normalize(),
            output_extension: default_output_extension(),
            output_bitrate: default_output_bitrate(),
            ffprobe_bin: default_ffprobe_bin(),
        }
    }
}

/// Housekeeping sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HousekeepingConfig {
    #[serde(default = "default_housekeeping_interval_secs")]
    pub interval_secs: u64,
    /// Files smaller than this with no recording row are orphans
    #[serde(default = "default_min_valid_bytes")]
    pub min_valid_bytes: u64,
    /// Temporary and test artifacts older than this are removed
    #[serde(default = "default_temp_retention_hours")]
    pub temp_retention_hours: u64,
    /// Files modified more recently than this are never treated as orphans
    #[serde(default = "default_orphan_min_age_secs")]
    pub orphan_min_age_secs: u64,
    /// Retention applied to shows without their own policy (0 = keep forever)
    #[serde(default = "default_retention_days")]
    pub default_retention_days: u32,
    pub default_retention_max_count: Option<u32>,
}

fn default_housekeeping_interval_secs() -> u64 {
    3600
}

fn default_min_valid_bytes() -> u64 {
    102_400
}

fn default_temp_retention_hours() -> u64 {
    24
}

fn default_orphan_min_age_secs() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    30
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_housekeeping_interval_secs(),
            min_valid_bytes: default_min_valid_bytes(),
            temp_retention_hours: default_temp_retention_hours(),
            orphan_min_age_secs: default_orphan_min_age_secs(),
            default_retention_days: default_retention_days(),
            default_retention_max_count: None,
        }
    }
}

/// Status HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default = "default_status_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_status_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: default_status_enabled(),
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub compatibility: CompatibilityConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set and parse:
    /// - RADIOGRAB_DATABASE_PATH -> storage.database_path
    /// - RADIOGRAB_TIMEZONE -> scheduler.timezone
    /// - RADIOGRAB_MAX_CONCURRENT_CAPTURES -> capture.max_concurrent_captures
    /// - RADIOGRAB_TIMEOUT_GRACE_SECS -> capture.timeout_grace_secs
    /// - RADIOGRAB_ASSUMED_BITRATE_KBPS -> compatibility.assumed_bitrate_kbps
    /// - RADIOGRAB_COMPAT_TTL_HOURS -> compatibility.ttl_hours
    /// - RADIOGRAB_MIN_BYTES_PER_SEC -> quality.min_bytes_per_sec
    /// - RADIOGRAB_DEFAULT_RETENTION_DAYS -> housekeeping.default_retention_days
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RADIOGRAB_DATABASE_PATH") {
            if !val.is_empty() {
                self.storage.database_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_TIMEZONE") {
            if !val.is_empty() {
                self.scheduler.timezone = val;
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_MAX_CONCURRENT_CAPTURES") {
            if let Ok(max) = val.parse::<u32>() {
                self.capture.max_concurrent_captures = max;
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_TIMEOUT_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.capture.timeout_grace_secs = secs;
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_ASSUMED_BITRATE_KBPS") {
            if let Ok(kbps) = val.parse::<u32>() {
                self.compatibility.assumed_bitrate_kbps = kbps;
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_COMPAT_TTL_HOURS") {
            if let Ok(hours) = val.parse::<u64>() {
                self.compatibility.ttl_hours = hours;
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_MIN_BYTES_PER_SEC") {
            if let Ok(bps) = val.parse::<u64>() {
                self.quality.min_bytes_per_sec = bps;
            }
        }

        if let Ok(val) = env::var("RADIOGRAB_DEFAULT_RETENTION_DAYS") {
            if let Ok(days) = val.parse::<u32>() {
                self.housekeeping.default_retention_days = days;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests must not interleave
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("RADIOGRAB_DATABASE_PATH");
        env::remove_var("RADIOGRAB_TIMEZONE");
        env::remove_var("RADIOGRAB_MAX_CONCURRENT_CAPTURES");
        env::remove_var("RADIOGRAB_TIMEOUT_GRACE_SECS");
        env::remove_var("RADIOGRAB_ASSUMED_BITRATE_KBPS");
        env::remove_var("RADIOGRAB_COMPAT_TTL_HOURS");
        env::remove_var("RADIOGRAB_MIN_BYTES_PER_SEC");
        env::remove_var("RADIOGRAB_DEFAULT_RETENTION_DAYS");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            refresh in 1u64..3600,
            max_captures in 0u32..64,
            grace in 0u64..120,
            bitrate in 8u32..512,
            ttl in 1u64..168,
            min_bps in 0u64..100_000,
            retention_days in 0u32..365,
            normalize in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[scheduler]
timezone = "Europe/Berlin"
refresh_interval_secs = {}

[capture]
max_concurrent_captures = {}
timeout_grace_secs = {}

[compatibility]
assumed_bitrate_kbps = {}
ttl_hours = {}

[quality]
min_bytes_per_sec = {}
normalize = {}

[housekeeping]
default_retention_days = {}
"#,
                refresh, max_captures, grace, bitrate, ttl, min_bps, normalize, retention_days
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.scheduler.timezone.as_str(), "Europe/Berlin");
            prop_assert_eq!(config.scheduler.refresh_interval_secs, refresh);
            prop_assert_eq!(config.capture.max_concurrent_captures, max_captures);
            prop_assert_eq!(config.capture.timeout_grace_secs, grace);
            prop_assert_eq!(config.compatibility.assumed_bitrate_kbps, bitrate);
            prop_assert_eq!(config.compatibility.ttl_hours, ttl);
            prop_assert_eq!(config.quality.min_bytes_per_sec, min_bps);
            prop_assert_eq!(config.quality.normalize, normalize);
            prop_assert_eq!(config.housekeeping.default_retention_days, retention_days);
        }

        #[test]
        fn prop_env_overrides_max_concurrent_captures(
            initial in 0u32..16,
            override_value in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[capture]\nmax_concurrent_captures = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RADIOGRAB_MAX_CONCURRENT_CAPTURES", override_value.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.capture.max_concurrent_captures, override_value);
        }

        #[test]
        fn prop_env_overrides_min_bytes_per_sec(
            initial in 0u64..10_000,
            override_value in 0u64..100_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[quality]\nmin_bytes_per_sec = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("RADIOGRAB_MIN_BYTES_PER_SEC", override_value.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.quality.min_bytes_per_sec, override_value);
        }
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("RADIOGRAB_ASSUMED_BITRATE_KBPS", "fast");
        env::set_var("RADIOGRAB_TIMEZONE", "America/New_York");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.compatibility.assumed_bitrate_kbps, 128);
        assert_eq!(config.scheduler.timezone, "America/New_York");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.storage.database_path, PathBuf::from("radiograb.db"));
        assert_eq!(config.scheduler.timezone, "UTC");
        assert_eq!(config.capture.max_concurrent_captures, 0);
        assert_eq!(config.capture.timeout_grace_secs, 10);
        assert!(config.capture.probe_when_unknown);
        assert_eq!(config.compatibility.assumed_bitrate_kbps, 128);
        assert_eq!(config.compatibility.ttl_hours, 24);
        assert_eq!(config.quality.min_bytes_per_sec, 2048);
        assert_eq!(config.housekeeping.min_valid_bytes, 102_400);
        assert_eq!(config.housekeeping.default_retention_max_count, None);
        assert_eq!(config.status.bind_addr, "127.0.0.1:7879");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[capture]
ffmpeg_bin = "/opt/ffmpeg/bin/ffmpeg"

[housekeeping]
default_retention_max_count = 10
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.capture.ffmpeg_bin, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.capture.wget_bin, "wget");
        assert_eq!(config.housekeeping.default_retention_max_count, Some(10));
        assert_eq!(config.housekeeping.default_retention_days, 30);
        assert!(config.quality.normalize);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = Config::parse_toml("[capture\nmax_concurrent_captures = 2");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
