//! Unified logging for the bridge services
//!
//! Console output uses a compact `timestamp [LEVEL] message` layout. When a
//! log directory is configured a second layer writes to a daily rolling file
//! through a non-blocking writer; the worker guard lives for the whole process.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Polling started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer flushing until process exit
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and default filter target
    pub service_name: String,
    /// Directory for rolling files; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Emit JSON lines in the file layer
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: None,
            level: Level::INFO,
            enable_json: false,
        }
    }
}

/// Parse a textual level ("info", "DEBUG", "warning"...) falling back to INFO.
pub fn parse_level(value: &str) -> Level {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.trim().is_empty() => EnvFilter::new(env_str),
        _ => {
            let level = config.level.as_str().to_ascii_lowercase();
            EnvFilter::new(format!(
                "{level},{}={level}",
                config.service_name.replace('-', "_")
            ))
        },
    }
}

/// Initialize logging system with configuration
///
/// Calling this twice is harmless: the second global subscriber install is
/// rejected and reported as an error without touching the first one.
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(build_filter(&config))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::debug!("Logging: {} (console only)", config.service_name),
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARNING"), Level::WARN);
        assert_eq!(parse_level(" error "), Level::ERROR);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_init_creates_log_dir_and_rejects_second_install() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("logs");
        let config = LogConfig {
            service_name: "bridgesrv-test".to_string(),
            log_dir: Some(dir.clone()),
            level: Level::DEBUG,
            enable_json: false,
        };

        let first = init_with_config(config.clone());
        assert!(dir.exists());
        if first.is_ok() {
            assert!(init_with_config(config).is_err());
        }
    }
}
