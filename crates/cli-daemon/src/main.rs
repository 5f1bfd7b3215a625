//! CLI entry point for the RadioGrab recording daemon
//!
//! Runs the daemon or one of its one-shot operations: schedule translation,
//! stream compatibility testing and a housekeeping sweep.

use clap::{Parser, Subcommand};
use radiograb_daemon::{
    translate_phrase, CompatibilityTester, Config, Daemon, Housekeeper, Store,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// RadioGrab - scheduled internet radio recording
#[derive(Parser, Debug)]
#[command(name = "radiograb")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "radiograb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the recording daemon until interrupted
    Run {
        /// Skip the capture tool checks. For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Translate a schedule phrase into cron expressions
    Translate {
        /// e.g. "Tuesdays at 7pm" or "Mon, Wed, Fri at 6:30 am"
        #[arg(required = true, num_args = 1..)]
        phrase: Vec<String>,
    },
    /// Test a stream URL against the capture tools and store the result
    TestStream {
        url: String,
        /// Single short probe with one tool instead of the full test
        #[arg(long, default_value = "false")]
        quick: bool,
    },
    /// Run one housekeeping sweep
    Sweep,
}

/// A missing file at the default location falls back to defaults plus env
fn load_config(path: &Path) -> Result<Config, radiograb_daemon::config::ConfigError> {
    if path.exists() {
        return Config::load(path);
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if let Command::Translate { phrase } = &args.command {
        return translate(&phrase.join(" "));
    }

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Run { skip_checks } => run(config, skip_checks).await,
        Command::TestStream { url, quick } => test_stream(config, &url, quick).await,
        Command::Sweep => sweep(config).await,
        Command::Translate { .. } => ExitCode::SUCCESS,
    }
}

fn translate(phrase: &str) -> ExitCode {
    match translate_phrase(phrase) {
        Ok(airings) => {
            for airing in airings {
                println!("{}\t{}", airing.expr, airing.description);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Could not translate '{}': {}", phrase, e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, skip_checks: bool) -> ExitCode {
    let daemon = if skip_checks {
        warn!("Skipping capture tool checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::from_config(config)
    };

    let daemon = match daemon {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        database = %daemon.config.storage.database_path.display(),
        recordings = %daemon.config.storage.recordings_dir.display(),
        max_concurrent_captures = daemon.executor.admission().capacity(),
        "RadioGrab daemon starting"
    );
    if daemon.config.status.enabled {
        info!("Status endpoint on http://{}/status", daemon.config.status.bind_addr);
    }

    match daemon.run_until_shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon error");
            ExitCode::FAILURE
        }
    }
}

fn open_store(config: &Config) -> Option<Store> {
    match Store::open(&config.storage.database_path) {
        Ok(store) => Some(store),
        Err(e) => {
            error!(error = %e, "Failed to open database");
            None
        }
    }
}

async fn test_stream(config: Config, url: &str, quick: bool) -> ExitCode {
    let Some(store) = open_store(&config) else {
        return ExitCode::FAILURE;
    };
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });
    let tester = CompatibilityTester::new(store, &config, cancel);

    if quick {
        let result = tester.quick_test(url).await;
        println!(
            "{}\t{}\t{} bytes in {:.1}s{}",
            result.tool,
            if result.success { "ok" } else { "failed" },
            result.bytes,
            result.elapsed_secs,
            result.error.map(|e| format!("\t{}", e)).unwrap_or_default()
        );
        return if result.success {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    match tester.test_and_store(url).await {
        Ok(record) => {
            for r in &record.results {
                println!(
                    "{}\t{}\tscore {}\t{} bytes in {:.1}s",
                    r.tool,
                    if r.success { "ok" } else { "failed" },
                    r.score,
                    r.bytes,
                    r.elapsed_secs
                );
            }
            println!(
                "status: {}  recommended: {}",
                record.status.as_str(),
                record
                    .recommended_tool
                    .map(|t| t.as_str())
                    .unwrap_or("none")
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Could not store compatibility result");
            ExitCode::FAILURE
        }
    }
}

async fn sweep(config: Config) -> ExitCode {
    let Some(store) = open_store(&config) else {
        return ExitCode::FAILURE;
    };
    let housekeeper = Housekeeper::new(store, config.housekeeping.clone(), &config.storage);
    match housekeeper.sweep().await {
        Ok(report) => {
            println!(
                "orphans: {}  temp: {}  retention: {}  freed: {} bytes",
                report.orphans_removed,
                report.temp_removed,
                report.retention_removed,
                report.bytes_freed
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Housekeeping sweep failed");
            ExitCode::FAILURE
        }
    }
}
