//! Prometheus publication of collected snapshots
//!
//! Each [`MetricFamily`] in a snapshot maps to one registered `GaugeVec`
//! in the default registry. A vec is registered the first time its family
//! appears and is reset-then-repopulated on every successful cycle, so a
//! label set that vanished from the cluster stops being exported. Exporter
//! self-metrics live in a register-once global, shared by all handles.

use anyhow::{Context, Result};
use collector_lib::Snapshot;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Publishes snapshots into the default Prometheus registry.
#[derive(Default)]
pub struct Publisher {
    families: Mutex<HashMap<String, GaugeVec>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: &Snapshot) -> Result<()> {
        let mut families = self
            .families
            .lock()
            .expect("publisher mutex poisoned");
        for family in snapshot {
            if !families.contains_key(&family.name) {
                let labels: Vec<&str> = family.label_names.iter().map(String::as_str).collect();
                let vec = register_gauge_vec!(&family.name, &family.help, &labels)
                    .with_context(|| format!("registering gauge family {}", family.name))?;
                families.insert(family.name.clone(), vec);
            }
            let vec = &families[&family.name];
            vec.reset();
            for sample in &family.samples {
                let values: Vec<&str> =
                    sample.label_values.iter().map(String::as_str).collect();
                vec.with_label_values(&values).set(sample.value);
            }
        }
        Ok(())
    }
}

/// Histogram buckets for cycle wall time in seconds.
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<ExporterMetricsInner> = OnceLock::new();

struct ExporterMetricsInner {
    cycle_seconds: HistogramVec,
    cycle_errors: IntCounterVec,
}

impl ExporterMetricsInner {
    fn new() -> Self {
        Self {
            cycle_seconds: register_histogram_vec!(
                "slurm_exporter_cycle_seconds",
                "Wall time of one collection cycle",
                &["loop"],
                CYCLE_BUCKETS.to_vec()
            )
            .expect("failed to register cycle_seconds"),
            cycle_errors: register_int_counter_vec!(
                "slurm_exporter_cycle_errors_total",
                "Collection cycles that were skipped after a failure",
                &["loop"]
            )
            .expect("failed to register cycle_errors"),
        }
    }
}

/// Lightweight handle to the exporter's self-metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    _private: (),
}

impl Default for ExporterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ExporterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ExporterMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn observe_cycle(&self, loop_name: &str, duration_secs: f64) {
        self.inner()
            .cycle_seconds
            .with_label_values(&[loop_name])
            .observe(duration_secs);
    }

    pub fn inc_cycle_errors(&self, loop_name: &str) {
        self.inner()
            .cycle_errors
            .with_label_values(&[loop_name])
            .inc();
    }
}
