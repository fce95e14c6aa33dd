//! Console logging backend.

use super::MetricLogger;
use std::collections::HashMap;

/// Logger that prints metrics to stdout via tracing.
#[derive(Default)]
pub struct ConsoleLogger {
    run_name: Option<String>,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every line with `run_name`.
    pub fn with_run_name(run_name: impl Into<String>) -> Self {
        Self {
            run_name: Some(run_name.into()),
        }
    }
}

/// `k=v` pairs in key order.
pub(crate) fn format_metrics(metrics: &HashMap<String, f64>) -> String {
    let mut sorted: Vec<_> = metrics.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={:.4}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

impl MetricLogger for ConsoleLogger {
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let line = format_metrics(metrics);
        match &self.run_name {
            Some(run) => tracing::info!(run = %run, step, "{}", line),
            None => tracing::info!(step, "{}", line),
        }
    }
}
