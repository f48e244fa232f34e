use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use zlv_core::SourceRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportError {
    pub message: String,
    pub data: JsonValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub passed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub warnings: u64,
    pub errors: Vec<ReportError>,
}

impl Report {
    /// Records that reached a terminal outcome.
    pub fn total(&self) -> u64 {
        self.passed + self.skipped + self.failed
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "passed: {}  skipped: {}  failed: {}  warnings: {}",
            self.passed, self.skipped, self.failed, self.warnings
        )?;
        for error in &self.errors {
            writeln!(f, "- {}", error.message)?;
            writeln!(f, "  {}", error.data)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    passed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    warnings: AtomicU64,
    errors: Mutex<Vec<ReportError>>,
}

/// Shared run tally. Cheap to clone; every clone feeds the same counters.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    inner: Arc<Counters>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passed(&self, record: &SourceRecord) {
        debug!(line = record.line, "record passed");
        self.inner.passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self, record: &SourceRecord) {
        debug!(line = record.line, "record skipped");
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self, record: &SourceRecord, error: &dyn fmt::Display) {
        let message = error.to_string();
        warn!(line = record.line, error = %message, "record failed");
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ReportError {
                message,
                data: record.to_json(),
            });
    }

    /// Non-fatal notice; does not count as a terminal outcome.
    pub fn warn(&self, record: &SourceRecord, message: &str) {
        warn!(line = record.line, note = message, "record warning");
        self.inner.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> Report {
        Report {
            passed: self.inner.passed.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            warnings: self.inner.warnings.load(Ordering::Relaxed),
            errors: self
                .inner
                .errors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}
