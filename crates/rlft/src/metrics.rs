//! Per-step scalar statistics averaged between log emissions.

use crate::distributed::Collective;
use crate::Result;
use std::collections::{BTreeMap, HashMap};

/// Metric name for the mean number of scored completion tokens.
pub const COMPLETION_LENGTH: &str = "completion_length";
/// Metric name for the mean masked KL divergence.
pub const KL: &str = "kl";

/// Append-only lists of values per metric name, drained by [`flush`].
///
/// Owned by the training loop and passed by `&mut` into the loss
/// computation, so nothing can be recorded between a flush's read and its
/// clear.
///
/// [`flush`]: MetricsAccumulator::flush
#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
    values: BTreeMap<String, Vec<f64>>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, value: f64) {
        self.values.entry(name.to_string()).or_default().push(value);
    }

    /// Average `value` across workers, then record it.
    pub fn record_reduced(
        &mut self,
        collective: &dyn Collective,
        name: &str,
        value: f64,
    ) -> Result<f64> {
        let reduced = collective.reduce_mean(value)?;
        self.record(name, reduced);
        Ok(reduced)
    }

    /// Values recorded for `name` since the last flush.
    pub fn pending(&self, name: &str) -> &[f64] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(Vec::is_empty)
    }

    /// Mean of every metric since the last flush, then clear everything.
    ///
    /// Metrics with no recorded values are left out.
    pub fn flush(&mut self) -> HashMap<String, f64> {
        let drained = std::mem::take(&mut self.values);
        let means: HashMap<String, f64> = drained
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| {
                let mean = v.iter().sum::<f64>() / v.len() as f64;
                (k, mean)
            })
            .collect();
        tracing::debug!(metrics = means.len(), "Flushed metrics");
        means
    }
}
