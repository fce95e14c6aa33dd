//! JSON-lines logging backend.

use super::MetricLogger;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Logger appending `{"step": n, "metric": value, ...}` lines to a file.
pub struct JsonlLogger {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLogger {
    /// Open `path` for appending, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    // A panic mid-write leaves at worst a partial line; keep logging.
    fn lock(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MetricLogger for JsonlLogger {
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let mut record: BTreeMap<&str, serde_json::Value> = metrics
            .iter()
            .map(|(k, v)| (k.as_str(), serde_json::json!(v)))
            .collect();
        record.insert("step", serde_json::json!(step));

        let mut writer = self.lock();
        let written = serde_json::to_writer(&mut *writer, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = written {
            tracing::warn!("Failed to write metrics line: {}", e);
        }
    }

    fn close(&self) {
        if let Err(e) = self.lock().flush() {
            tracing::warn!("Failed to flush metrics file: {}", e);
        }
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        self.close();
    }
}
