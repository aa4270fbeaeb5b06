//! Logging setup for the reconciler binary.
//!
//! Logs go to stderr (or a file) so that stdout carries only the JSON
//! results. Settings come from CLI flags first, then from the
//! `AZDO_LOG_LEVEL`, `AZDO_LOG_FILE` and `AZDO_LOG_FORMAT` environment
//! variables.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub const LOG_LEVEL_ENV: &str = "AZDO_LOG_LEVEL";
pub const LOG_FILE_ENV: &str = "AZDO_LOG_FILE";
pub const LOG_FORMAT_ENV: &str = "AZDO_LOG_FORMAT";

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Logging disabled.
    Off,
}

impl LogLevel {
    /// Parse a log level from a string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "off" | "none" => Some(Self::Off),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Output file path (None means stderr).
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

impl LogConfig {
    /// Combines CLI values with the environment. CLI wins; invalid values are errors.
    pub fn resolve(
        cli_level: Option<&str>,
        cli_file: Option<&Path>,
        cli_format: Option<&str>,
    ) -> Result<Self> {
        let level = match cli_level
            .map(str::to_string)
            .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        {
            Some(value) => match LogLevel::parse(&value) {
                Some(level) => level,
                None => bail!("Invalid log level '{value}'"),
            },
            None => LogLevel::default(),
        };
        let format = match cli_format
            .map(str::to_string)
            .or_else(|| std::env::var(LOG_FORMAT_ENV).ok())
        {
            Some(value) => match LogFormat::parse(&value) {
                Some(format) => format,
                None => bail!("Invalid log format '{value}' (expected 'text' or 'json')"),
            },
            None => LogFormat::default(),
        };
        let file = cli_file.map(Path::to_path_buf).or_else(|| {
            std::env::var(LOG_FILE_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });

        Ok(Self {
            level,
            file,
            format,
        })
    }

    /// Filter directive limiting output to this crate.
    pub fn filter_directive(&self) -> String {
        format!("azdo_reconciler={}", self.level.as_filter_str())
    }
}

/// Keeps the background writer alive; dropping it flushes pending records.
pub struct LogGuard {
    _writer_guard: WorkerGuard,
}

/// Installs the global subscriber.
///
/// Returns `Ok(None)` when logging is off.
#[must_use = "the returned guard must be held until application exit"]
pub fn init_logging(config: &LogConfig) -> Result<Option<LogGuard>> {
    if config.level == LogLevel::Off {
        return Ok(None);
    }
    let filter = EnvFilter::new(config.filter_directive());

    let to_file = config.file.is_some();
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .with_writer(writer)
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(to_file)
                .with_line_number(to_file);
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .context("Failed to install log subscriber")?;
        }
        LogFormat::Text => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(!to_file)
                .with_target(true)
                .with_level(true)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .context("Failed to install log subscriber")?;
        }
    }

    Ok(Some(LogGuard {
        _writer_guard: guard,
    }))
}
