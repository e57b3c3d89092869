use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::errors::{EngineError, Result};

const LOG_FILE_NAME: &str = "romdock-engine.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

/// Where and how verbosely the engine logs. `dir: None` writes to stderr,
/// which is what development runs and the test harness want; packaged
/// builds point `dir` at the app data directory and rotate daily.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub dir: Option<PathBuf>,
    pub level: String,
    pub rotation: LogRotation,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("logs")),
            level: "info".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

impl LogOptions {
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var("ROMDOCK_LOG_DIR") {
            let trimmed = raw.trim();
            options.dir = match trimmed {
                "" | "stderr" => None,
                dir => Some(PathBuf::from(dir)),
            };
        }
        if let Ok(raw) = std::env::var("ROMDOCK_LOG_LEVEL") {
            let trimmed = raw.trim().to_ascii_lowercase();
            if !trimmed.is_empty() {
                options.level = trimmed;
            }
        }
        if let Ok(raw) = std::env::var("ROMDOCK_LOG_ROTATION") {
            options.rotation = parse_rotation(&raw);
        }
        options
    }

    /// `RUST_LOG` wins outright; otherwise the configured level applies to
    /// the engine while the HTTP stack stays at warn. Chunk workers log
    /// per-attempt lines that would drown everything at debug without the
    /// dependency directives.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{},hyper=warn,reqwest=warn,h2=warn,rustls=warn",
                self.level
            ))
        })
    }
}

fn parse_rotation(raw: &str) -> LogRotation {
    match raw.trim().to_ascii_lowercase().as_str() {
        "hourly" => LogRotation::Hourly,
        "never" | "off" => LogRotation::Never,
        _ => LogRotation::Daily,
    }
}

/// Install the global subscriber. The returned guard owns the background
/// log writer; dropping it flushes buffered lines, so the caller keeps it
/// alive for the life of the process.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    match &options.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = match options.rotation {
                LogRotation::Daily => tracing_appender::rolling::daily(dir, LOG_FILE_NAME),
                LogRotation::Hourly => tracing_appender::rolling::hourly(dir, LOG_FILE_NAME),
                LogRotation::Never => tracing_appender::rolling::never(dir, LOG_FILE_NAME),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(options.filter())
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|err| EngineError::State(err.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(options.filter())
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|err| EngineError::State(err.to_string()))?;
            Ok(None)
        }
    }
}
