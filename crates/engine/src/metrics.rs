//! Metrics reporting seam
//!
//! A pure sink: the loop and algorithms push scalar observations out, and
//! nothing ever flows back in.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use trainer_core::{Epoch, Step};

/// Receives scalar metric observations from the loop and algorithms.
pub trait MetricsSink: Send + Sync {
    fn record(&self, step: Step, epoch: Epoch, name: &str, value: f64);
}

/// Default sink: emits each observation as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, step: Step, epoch: Epoch, name: &str, value: f64) {
        info!(target: "cadence::metrics", step, epoch, metric = name, value);
    }
}

/// One recorded observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub step: Step,
    pub epoch: Epoch,
    pub name: String,
    pub value: f64,
}

/// Recording sink for tests. Clones share the same record buffer.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetrics {
    records: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// All observations, in arrival order.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Values recorded under one metric name, in arrival order.
    pub fn values_for(&self, name: &str) -> Vec<f64> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn record(&self, step: Step, epoch: Epoch, name: &str, value: f64) {
        self.records.lock().push(MetricRecord {
            step,
            epoch,
            name: name.to_string(),
            value,
        });
    }
}
