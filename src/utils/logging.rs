use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Logging errors
#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Logger initialization error: {0}")]
    InitError(String),
}

/// Result type for logging operations
pub type LogResult<T> = Result<T, LogError>;

/// Logging levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = LogError;

    fn from_str(s: &str) -> LogResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "err" => Ok(LogLevel::Error),
            _ => Err(LogError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl LogLevel {
    /// Directive for `EnvFilter`, scoped to this crate plus warnings from the rest
    fn directive(&self) -> String {
        let own = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        format!("warn,sitebudget={}", own)
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn fmt_layer<W>(writer: W, ansi: bool, timestamps: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    if timestamps {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    }
}

/// Initialize the global logger.
///
/// `RUST_LOG` takes precedence over `level` when set. With `log_file` the
/// output is also appended, without colors, to that file.
pub fn init_logging(level: LogLevel, log_file: Option<&str>, stdout: bool, timestamps: bool) -> LogResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if stdout {
        layers.push(fmt_layer(std::io::stdout, true, timestamps));
    }
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        layers.push(fmt_layer(Mutex::new(file), false, timestamps));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LogError::InitError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_loosely() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!(matches!("loud".parse::<LogLevel>(), Err(LogError::InvalidLogLevel(_))));
        assert!(LogLevel::Trace < LogLevel::Error);
    }

    #[test]
    fn directive_keeps_dependencies_quiet() {
        assert_eq!(LogLevel::Debug.directive(), "warn,sitebudget=debug");
    }
}
