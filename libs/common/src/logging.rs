//! Logging bootstrap
//!
//! Console plus a daily-rolled file, both through tracing. `RUST_LOG`
//! overrides the configured levels when set.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Guards must live for the whole process or buffered lines are lost
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used for the file prefix ("acqsrv")
    pub service_name: String,
    /// Base directory for log files
    pub log_dir: PathBuf,
    pub console_level: Level,
    pub file_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            log_dir: PathBuf::from("logs"),
            console_level: Level::INFO,
            file_level: Level::DEBUG,
        }
    }
}

/// Initialise the global subscriber; call once, early in main
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(
        &config.log_dir,
        format!("{}.log", config.service_name),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    GUARDS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .expect("guard lock")
        .push(guard);

    let filter = match std::env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) => EnvFilter::new(format!(
            "{},{}={}",
            config.console_level, config.service_name, config.file_level
        )),
    };

    let console_layer = fmt::layer().with_target(false).boxed();
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    Ok(())
}

/// Console-only fallback for tools and tests
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .ok();
    Ok(())
}
