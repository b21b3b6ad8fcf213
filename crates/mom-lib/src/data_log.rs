//! Append-only data log
//!
//! Monitor samples and policy decisions are appended as JSON lines to a
//! single process-wide file. Logging is disabled until
//! [`start_data_logging`] is called.

use crate::record::Record;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{info, warn};

struct DataLogSink {
    path: PathBuf,
    file: File,
}

static DATA_LOG: OnceLock<Mutex<Option<DataLogSink>>> = OnceLock::new();

fn sink() -> &'static Mutex<Option<DataLogSink>> {
    DATA_LOG.get_or_init(|| Mutex::new(None))
}

/// Start appending records to `path`
pub fn start_data_logging(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open data log {}", path.display()))?;

    info!(path = %path.display(), "Start logging data");
    *sink().lock().unwrap_or_else(|e| e.into_inner()) = Some(DataLogSink { path, file });
    Ok(())
}

/// Stop appending records; later appends are dropped
pub fn stop_data_logging() {
    let previous = sink().lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(sink) = previous {
        info!(path = %sink.path.display(), "Stop logging data");
    }
}

pub fn is_data_logging() -> bool {
    sink().lock().unwrap_or_else(|e| e.into_inner()).is_some()
}

/// Append one record tagged with its type, source and sample bounds
pub fn append_data(log_type: &str, source: &str, data: Record, sample_start: f64, sample_end: f64) {
    let mut guard = sink().lock().unwrap_or_else(|e| e.into_inner());
    let Some(sink) = guard.as_mut() else {
        return;
    };

    let mut entry = Record::new();
    entry.insert("type".into(), Value::from(log_type));
    entry.insert("source".into(), Value::from(source));
    entry.insert("sample_start".into(), Value::from(sample_start));
    entry.insert("sample_end".into(), Value::from(sample_end));
    entry.insert("interval".into(), Value::from(sample_end - sample_start));
    entry.extend(data);

    let line = match serde_json::to_string(&entry) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, source = %source, "Failed to serialize data log entry");
            return;
        }
    };

    if let Err(e) = writeln!(sink.file, "{}", line) {
        warn!(error = %e, path = %sink.path.display(), "Failed to append to data log");
    }
}

/// Read back every entry of a data log file
pub fn read_data_log(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let contents = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read data log {}", path.as_ref().display()))?;

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("Malformed data log entry"))
        .collect()
}

/// Data log handle bound to one record type and source
#[derive(Debug, Clone)]
pub struct DataLogger {
    log_type: String,
    source: String,
}

impl DataLogger {
    pub fn new(log_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            log_type: log_type.into(),
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn append_data(&self, data: Record, sample_start: f64, sample_end: f64) {
        append_data(&self.log_type, &self.source, data, sample_start, sample_end);
    }
}
