//! Hardware-generation classification and weighted capacity scores
//!
//! Nodes advertise their hardware family through feature tags (`icelake`,
//! `genoa`) and typed GPU TRES entries (`h100`). A site-supplied weight
//! table converts per-generation totals into a normalized compute-unit
//! ("TRES") score and a double-precision GFLOP equivalent. The tables and
//! the TRES-to-GFLOPs scalar are configuration, never literals in the
//! engine.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

fn default_tres_to_gflops() -> f64 {
    // Site default carried from the source deployment.
    93.25
}

/// Site-tunable weight tables for hardware generations.
#[derive(Debug, Clone, Deserialize)]
pub struct WeightTable {
    /// CPU feature tag -> compute-unit weight per core.
    #[serde(default)]
    pub cpu: HashMap<String, f64>,
    /// GPU model -> compute-unit weight per card.
    #[serde(default)]
    pub gpu: HashMap<String, f64>,
    /// Scalar converting a TRES score into double-precision GFLOPs.
    #[serde(default = "default_tres_to_gflops")]
    pub tres_to_gflops: f64,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            cpu: HashMap::new(),
            gpu: HashMap::new(),
            tres_to_gflops: default_tres_to_gflops(),
        }
    }
}

/// Per-generation capacity accumulator: total vs. allocated CPU and GPU,
/// plus memory weighted by the node's allocation fraction.
///
/// A node may match zero, one, or several generation tags; each match
/// contributes independently. Unrecognized tags are silently ignored.
#[derive(Debug, Clone, Default)]
pub struct GenerationTotals {
    cpu_total: BTreeMap<String, f64>,
    cpu_alloc: BTreeMap<String, f64>,
    mem_alloc_weighted: BTreeMap<String, f64>,
    gpu_total: BTreeMap<String, f64>,
    gpu_alloc: BTreeMap<String, f64>,
}

impl GenerationTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one node's capacity into the generation buckets its feature
    /// tags match.
    #[allow(clippy::too_many_arguments)]
    pub fn record_node(
        &mut self,
        table: &WeightTable,
        features: &[String],
        cpu_total: u64,
        cpu_alloc: u64,
        alloc_mem_mb: u64,
        real_mem_mb: u64,
        gpu_total: u64,
        gpu_alloc: u64,
    ) {
        for tag in features {
            if table.cpu.contains_key(tag) {
                *self.cpu_total.entry(tag.clone()).or_default() += cpu_total as f64;
                *self.cpu_alloc.entry(tag.clone()).or_default() += cpu_alloc as f64;
                if real_mem_mb > 0 {
                    *self.mem_alloc_weighted.entry(tag.clone()).or_default() +=
                        cpu_total as f64 * alloc_mem_mb as f64 / real_mem_mb as f64;
                }
            }
            if table.gpu.contains_key(tag) {
                *self.gpu_total.entry(tag.clone()).or_default() += gpu_total as f64;
                *self.gpu_alloc.entry(tag.clone()).or_default() += gpu_alloc as f64;
            }
        }
    }

    /// Per-tag raw sums, for the per-generation gauge fields. Yields
    /// `(field, value)` pairs such as `("tcpuicelake", 4096.0)`.
    pub fn fields(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (prefix, map) in [
            ("tcpu", &self.cpu_total),
            ("ucpu", &self.cpu_alloc),
            ("umem", &self.mem_alloc_weighted),
            ("tgpu", &self.gpu_total),
            ("ugpu", &self.gpu_alloc),
        ] {
            for (tag, value) in map {
                out.push((format!("{prefix}{}", tag.replace('-', "")), *value));
            }
        }
        out
    }

    /// Apply the weight table to the accumulated per-generation sums.
    pub fn weighted(&self, table: &WeightTable) -> WeightedCapacity {
        let dot = |sums: &BTreeMap<String, f64>, weights: &HashMap<String, f64>| {
            sums.iter()
                .map(|(tag, v)| weights.get(tag).copied().unwrap_or(0.0) * v)
                .sum::<f64>()
        };
        let cpu_total = dot(&self.cpu_total, &table.cpu);
        WeightedCapacity {
            cpu_total,
            cpu_alloc: dot(&self.cpu_alloc, &table.cpu),
            // The memory-capacity score is taken to equal the CPU score; the
            // allocated-memory score weights the allocation-fraction sums.
            mem_total: cpu_total,
            mem_alloc: dot(&self.mem_alloc_weighted, &table.cpu),
            gpu_total: dot(&self.gpu_total, &table.gpu),
            gpu_alloc: dot(&self.gpu_alloc, &table.gpu),
            tres_to_gflops: table.tres_to_gflops,
        }
    }
}

/// Weighted compute-unit scores per resource class, total vs. allocated.
#[derive(Debug, Clone, Copy)]
pub struct WeightedCapacity {
    pub cpu_total: f64,
    pub cpu_alloc: f64,
    pub mem_total: f64,
    pub mem_alloc: f64,
    pub gpu_total: f64,
    pub gpu_alloc: f64,
    tres_to_gflops: f64,
}

impl WeightedCapacity {
    pub fn tres_total(&self) -> f64 {
        self.cpu_total + self.mem_total + self.gpu_total
    }

    pub fn tres_alloc(&self) -> f64 {
        self.cpu_alloc + self.mem_alloc + self.gpu_alloc
    }

    pub fn cpu_gflops_total(&self) -> f64 {
        self.tres_to_gflops * self.cpu_total
    }

    pub fn cpu_gflops_alloc(&self) -> f64 {
        self.tres_to_gflops * self.cpu_alloc
    }

    pub fn gpu_gflops_total(&self) -> f64 {
        self.tres_to_gflops * self.gpu_total
    }

    pub fn gpu_gflops_alloc(&self) -> f64 {
        self.tres_to_gflops * self.gpu_alloc
    }

    pub fn gflops_total(&self) -> f64 {
        self.cpu_gflops_total() + self.gpu_gflops_total()
    }

    pub fn gflops_alloc(&self) -> f64 {
        self.cpu_gflops_alloc() + self.gpu_gflops_alloc()
    }
}

/// The same weighting applied to one partition's billing weights instead of
/// the generation tables: `score = w_cpu*cpu + w_mem*mem + w_gpu*gpu`.
pub fn billing_score(w_cpu: f64, w_mem: f64, w_gpu: f64, cpu: f64, mem: f64, gpu: f64) -> f64 {
    w_cpu * cpu + w_mem * mem + w_gpu * gpu
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> WeightTable {
        WeightTable {
            cpu: HashMap::from([
                ("icelake".to_string(), 1.15),
                ("genoa".to_string(), 0.6),
            ]),
            gpu: HashMap::from([
                ("h100".to_string(), 546.9),
                ("a100".to_string(), 209.1),
            ]),
            tres_to_gflops: 93.25,
        }
    }

    #[test]
    fn test_record_and_weight() {
        let table = table();
        let mut totals = GenerationTotals::new();
        // 64-core icelake node, half allocated, half the memory allocated.
        totals.record_node(
            &table,
            &["icelake".to_string(), "intel".to_string()],
            64,
            32,
            128_000,
            256_000,
            0,
            0,
        );
        // 4xH100 node, fully allocated.
        totals.record_node(
            &table,
            &["genoa".to_string(), "h100".to_string()],
            96,
            96,
            512_000,
            512_000,
            4,
            4,
        );

        let w = totals.weighted(&table);
        assert!((w.cpu_total - (1.15 * 64.0 + 0.6 * 96.0)).abs() < 1e-9);
        assert!((w.cpu_alloc - (1.15 * 32.0 + 0.6 * 96.0)).abs() < 1e-9);
        assert_eq!(w.mem_total, w.cpu_total);
        // icelake: 64 * 0.5 = 32 weighted cores; genoa: 96 * 1.0.
        assert!((w.mem_alloc - (1.15 * 32.0 + 0.6 * 96.0)).abs() < 1e-9);
        assert!((w.gpu_total - 546.9 * 4.0).abs() < 1e-9);
        assert!((w.gflops_total() - 93.25 * (w.cpu_total + w.gpu_total)).abs() < 1e-6);
    }

    #[test]
    fn test_unrecognized_tags_ignored() {
        let table = table();
        let mut totals = GenerationTotals::new();
        totals.record_node(
            &table,
            &["skylake".to_string()],
            64,
            64,
            1000,
            1000,
            0,
            0,
        );
        let w = totals.weighted(&table);
        assert_eq!(w.cpu_total, 0.0);
        assert!(totals.fields().is_empty());
    }

    #[test]
    fn test_fields_naming() {
        let table = table();
        let mut totals = GenerationTotals::new();
        totals.record_node(&table, &["icelake".to_string()], 8, 4, 0, 1, 0, 0);
        let fields = totals.fields();
        assert!(fields.iter().any(|(f, v)| f == "tcpuicelake" && *v == 8.0));
        assert!(fields.iter().any(|(f, v)| f == "ucpuicelake" && *v == 4.0));
    }

    #[test]
    fn test_billing_score() {
        assert_eq!(billing_score(1.0, 0.25, 10.0, 8.0, 32.0, 2.0), 36.0);
    }
}
