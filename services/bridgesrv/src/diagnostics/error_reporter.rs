//! Deduplicated log of entity ids that a poll result could not be mapped to
//!
//! Line format: `YYYY-mm-dd HH:MM:SS - MBID_NOT_FOUND - <id>[ - <json context>]`

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

/// Default file name, relative to the working directory
pub const DEFAULT_ERROR_LOG: &str = "error.log";
/// Default suppression window per entity id
pub const DEFAULT_DEDUPE_WINDOW: Duration = Duration::from_secs(60);

pub struct ErrorReporter {
    path: PathBuf,
    window: Duration,
    last_logged: Mutex<HashMap<String, Instant>>,
}

impl ErrorReporter {
    pub fn new(path: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            path: path.into(),
            window,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a missing entity id unless it was reported within the window
    ///
    /// Returns `true` when a line was emitted.
    pub fn report_missing(&self, entity_id: &str, context: Option<&Value>) -> bool {
        let now = Instant::now();
        let mut last_logged = self.last_logged.lock();
        if let Some(last) = last_logged.get(entity_id) {
            if now.duration_since(*last) < self.window {
                debug!("Missing entity {} already reported", entity_id);
                return false;
            }
        }
        last_logged.insert(entity_id.to_string(), now);

        let mut line = format!(
            "{} - MBID_NOT_FOUND - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            entity_id
        );
        if let Some(context) = context {
            match serde_json::to_string(context) {
                Ok(json) => {
                    line.push_str(" - ");
                    line.push_str(&json);
                },
                Err(_) => line.push_str(" - (context serialization failed)"),
            }
        }
        line.push('\n');

        warn!("Entity id not found: {}", entity_id);
        if let Err(e) = self.append(&line) {
            warn!("Cannot write {}: {}", self.path.display(), e);
        }
        true
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG, DEFAULT_DEDUPE_WINDOW)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_repeat_within_window_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.log");
        let reporter = ErrorReporter::new(&path, DEFAULT_DEDUPE_WINDOW);

        assert!(reporter.report_missing("40001", Some(&json!({"base_address": 40000}))));
        assert!(!reporter.report_missing("40001", None));
        assert!(reporter.report_missing("40002", None));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("MBID_NOT_FOUND - 40001 - {\"base_address\":40000}"));
        assert!(lines[1].ends_with("MBID_NOT_FOUND - 40002"));
    }

    #[test]
    fn test_reported_again_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("error.log");
        let reporter = ErrorReporter::new(&path, Duration::from_millis(20));

        assert!(reporter.report_missing("x", None));
        std::thread::sleep(Duration::from_millis(40));
        assert!(reporter.report_missing("x", None));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    #[traced_test]
    fn test_report_emits_warning_once() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = ErrorReporter::new(dir.path().join("error.log"), DEFAULT_DEDUPE_WINDOW);

        reporter.report_missing("missing-1", None);
        reporter.report_missing("missing-1", None);

        assert!(logs_contain("Entity id not found: missing-1"));
        assert!(logs_contain("already reported"));
    }
}
