//! Cluster-wide node aggregation
//!
//! Processes one `scontrol -o show node` dump into the `lsload` gauge
//! family: cluster totals, per-bucket state sums, per-generation sums,
//! the occupancy score and the weighted TRES/GFLOPs scores.

use crate::hardware::{GenerationTotals, WeightTable};
use crate::record::RawRecord;
use crate::snapshot::MetricFamily;
use crate::state::{Bucket, StateRules};
use crate::tres::TresMap;
use tracing::debug;

/// Per-bucket running sums of node count, CPU, memory and GPU capacity.
#[derive(Debug, Clone, Copy, Default)]
struct BucketSums {
    nodes: u64,
    cpu: u64,
    mem_mb: u64,
    gpu: u64,
}

/// Aggregates a node dump into cluster-level gauges.
#[derive(Debug, Clone)]
pub struct ClusterCollector {
    weights: WeightTable,
    rules: StateRules,
    /// Restrict aggregation to nodes whose name contains this substring
    /// (organizational prefix), when set.
    node_filter: Option<String>,
}

impl ClusterCollector {
    pub fn new(weights: WeightTable, rules: StateRules, node_filter: Option<String>) -> Self {
        Self {
            weights,
            rules,
            node_filter,
        }
    }

    /// Aggregate one node dump. Malformed lines are dropped, never fatal.
    pub fn collect(&self, node_dump: &str) -> MetricFamily {
        let mut node_tot = 0u64;
        let mut cpu_tot = 0u64;
        let mut cpu_alloc = 0u64;
        let mut cpu_load = 0.0f64;
        let mut real_mem = 0u64;
        let mut mem_alloc = 0u64;
        let mut mem_load = 0i64;
        let mut gpu_tot = 0u64;
        let mut gpu_alloc = 0u64;
        let mut per_alloc = 0.0f64;
        let mut buckets = [BucketSums::default(); Bucket::ALL.len()];
        let mut generations = GenerationTotals::new();

        for line in node_dump.lines() {
            let record = RawRecord::parse(line);
            let Some(name) = record.get("NodeName") else {
                if !record.is_empty() {
                    debug!(line, "dropping node record without NodeName");
                }
                continue;
            };
            if let Some(filter) = &self.node_filter {
                if !name.contains(filter.as_str()) {
                    continue;
                }
            }

            let cfg_tres = TresMap::from_field(&record, "CfgTRES");
            let alloc_tres = TresMap::from_field(&record, "AllocTRES");
            let num_gpu = cfg_tres.gpus();
            let agpu = if num_gpu > 0 { alloc_tres.gpus() } else { 0 };

            let ncpu_tot = record.u64_or("CPUTot", 0);
            let ncpu_alloc = record.u64_or("CPUAlloc", 0);
            let nreal_mem = record.u64_or("RealMemory", 0);
            let nalloc_mem = record.u64_or("AllocMem", 0);

            node_tot += 1;
            cpu_tot += ncpu_tot;
            cpu_alloc += ncpu_alloc;
            // CPU load sums only over nodes reporting a numeric value; the
            // node still counts in nodetot.
            if let Some(load) = record.f64_opt("CPULoad") {
                cpu_load += load;
            }
            real_mem += nreal_mem;
            // Allocated memory is clamped to the node's real memory.
            mem_alloc += nalloc_mem.min(nreal_mem);
            // Slurm reports free memory only; back-calculate what is used.
            if let Some(free) = record.f64_opt("FreeMem") {
                mem_load += nreal_mem as i64 - free as i64;
            }
            gpu_tot += num_gpu;
            gpu_alloc += agpu;

            let features = record.list("AvailableFeatures");
            generations.record_node(
                &self.weights,
                &features,
                ncpu_tot,
                ncpu_alloc,
                nalloc_mem,
                nreal_mem,
                num_gpu,
                agpu,
            );

            let set = self.rules.classify(record.str_or("State", ""));
            for bucket in set.iter() {
                let sums = &mut buckets[bucket as usize];
                sums.nodes += 1;
                sums.cpu += ncpu_tot;
                sums.mem_mb += nreal_mem;
                sums.gpu += num_gpu;
            }

            per_alloc += occupancy(ncpu_alloc, ncpu_tot, nalloc_mem, nreal_mem, agpu, num_gpu);
        }

        let mut family = MetricFamily::new("lsload", "Aggregate cluster node stats", &["field"]);
        family.push_field("nodetot", node_tot as f64);
        family.push_field("cputot", cpu_tot as f64);
        family.push_field("cpualloc", cpu_alloc as f64);
        family.push_field("cpuload", cpu_load);
        family.push_field("realmem", real_mem as f64);
        family.push_field("memalloc", mem_alloc as f64);
        family.push_field("memload", mem_load as f64);
        family.push_field("gputot", gpu_tot as f64);
        family.push_field("gpualloc", gpu_alloc as f64);
        for bucket in Bucket::ALL {
            let sums = buckets[bucket as usize];
            let prefix = bucket.prefix();
            family.push_field(&format!("{prefix}tot"), sums.nodes as f64);
            family.push_field(&format!("{prefix}cpu"), sums.cpu as f64);
            family.push_field(&format!("{prefix}mem"), sums.mem_mb as f64);
            family.push_field(&format!("{prefix}gpu"), sums.gpu as f64);
        }
        family.push_field("peralloc", per_alloc);
        for (field, value) in generations.fields() {
            family.push_field(&field, value);
        }

        let w = generations.weighted(&self.weights);
        family.push_field("tcputres", w.cpu_total);
        family.push_field("tmemtres", w.mem_total);
        family.push_field("tgputres", w.gpu_total);
        family.push_field("ucputres", w.cpu_alloc);
        family.push_field("umemtres", w.mem_alloc);
        family.push_field("ugputres", w.gpu_alloc);
        family.push_field("ttres", w.tres_total());
        family.push_field("utres", w.tres_alloc());
        family.push_field("tcgflops", w.cpu_gflops_total());
        family.push_field("ucgflops", w.cpu_gflops_alloc());
        family.push_field("tggflops", w.gpu_gflops_total());
        family.push_field("uggflops", w.gpu_gflops_alloc());
        family.push_field("tgflops", w.gflops_total());
        family.push_field("ugflops", w.gflops_alloc());
        family
    }
}

/// Per-node occupancy: a node is fully used when any single resource
/// dimension is saturated. GPU-less nodes use a denominator floor of 1,
/// which yields a zero contribution.
fn occupancy(
    cpu_alloc: u64,
    cpu_tot: u64,
    alloc_mem: u64,
    real_mem: u64,
    gpu_alloc: u64,
    gpu_tot: u64,
) -> f64 {
    let cpu_frac = if cpu_tot > 0 {
        cpu_alloc as f64 / cpu_tot as f64
    } else {
        0.0
    };
    let mem_frac = if real_mem > 0 {
        alloc_mem.min(real_mem) as f64 / real_mem as f64
    } else {
        0.0
    };
    let gpu_frac = gpu_alloc as f64 / (gpu_tot.max(1)) as f64;
    cpu_frac.max(mem_frac).max(gpu_frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn collector() -> ClusterCollector {
        let weights = WeightTable {
            cpu: HashMap::from([("icelake".to_string(), 1.15)]),
            gpu: HashMap::from([("h100".to_string(), 546.9)]),
            tres_to_gflops: 93.25,
        };
        ClusterCollector::new(weights, StateRules::default(), None)
    }

    #[test]
    fn test_mem_round_trip() {
        let dump = "NodeName=n1 CPUTot=64 CPUAlloc=32 RealMemory=256000 AllocMem=128000 \
                    FreeMem=64000 State=MIXED CfgTRES=cpu=64,mem=256000M AllocTRES=cpu=32\n";
        let family = collector().collect(dump);
        assert_eq!(family.value(&["memalloc"]), Some(128000.0));
        assert_eq!(family.value(&["memload"]), Some(192000.0));
        assert_eq!(family.value(&["nodetot"]), Some(1.0));
        assert_eq!(family.value(&["mixedtot"]), Some(1.0));
    }

    #[test]
    fn test_alloc_mem_clamped_to_real() {
        // The source data does not enforce AllocMem <= RealMemory.
        let dump = "NodeName=n1 CPUTot=4 CPUAlloc=0 RealMemory=1000 AllocMem=5000 State=IDLE\n";
        let family = collector().collect(dump);
        assert_eq!(family.value(&["memalloc"]), Some(1000.0));
    }

    #[test]
    fn test_occupancy_max_over_dimensions() {
        // cpu 0.5, mem 0.9, zero GPUs -> 0.9 with the denominator floor.
        assert_eq!(occupancy(32, 64, 900, 1000, 0, 0), 0.9);
        // gpu saturated dominates.
        assert_eq!(occupancy(1, 64, 0, 1000, 4, 4), 1.0);
    }

    #[test]
    fn test_na_load_skipped_but_node_counted() {
        let dump = "NodeName=n1 CPUTot=8 CPUAlloc=0 RealMemory=100 AllocMem=0 CPULoad=N/A \
                    FreeMem=N/A State=IDLE\n\
                    NodeName=n2 CPUTot=8 CPUAlloc=0 RealMemory=100 AllocMem=0 CPULoad=2.5 \
                    FreeMem=50 State=IDLE\n";
        let family = collector().collect(dump);
        assert_eq!(family.value(&["nodetot"]), Some(2.0));
        assert_eq!(family.value(&["cpuload"]), Some(2.5));
        assert_eq!(family.value(&["memload"]), Some(50.0));
        assert_eq!(family.value(&["idletot"]), Some(2.0));
    }

    #[test]
    fn test_overlapping_buckets_both_counted() {
        let dump = "NodeName=n1 CPUTot=16 CPUAlloc=0 RealMemory=1000 AllocMem=0 \
                    State=MIXED+RESERVED+DRAIN\n";
        let family = collector().collect(dump);
        assert_eq!(family.value(&["restot"]), Some(1.0));
        assert_eq!(family.value(&["draintot"]), Some(1.0));
        assert_eq!(family.value(&["rescpu"]), Some(16.0));
        assert_eq!(family.value(&["mixedtot"]), Some(0.0));
    }

    #[test]
    fn test_generation_and_weighted_scores() {
        let dump = "NodeName=n1 CPUTot=64 CPUAlloc=32 RealMemory=256000 AllocMem=128000 \
                    AvailableFeatures=icelake,intel State=MIXED \
                    CfgTRES=cpu=64,mem=256000M,gres/gpu=4 \
                    AllocTRES=cpu=32,mem=128000M,gres/gpu=2\n";
        let family = collector().collect(dump);
        assert_eq!(family.value(&["gputot"]), Some(4.0));
        assert_eq!(family.value(&["gpualloc"]), Some(2.0));
        assert_eq!(family.value(&["tcpuicelake"]), Some(64.0));
        assert_eq!(family.value(&["ucpuicelake"]), Some(32.0));
        let tcputres = family.value(&["tcputres"]).unwrap();
        assert!((tcputres - 1.15 * 64.0).abs() < 1e-9);
        let tcgflops = family.value(&["tcgflops"]).unwrap();
        assert!((tcgflops - 93.25 * tcputres).abs() < 1e-9);
    }

    #[test]
    fn test_node_filter() {
        let weights = WeightTable::default();
        let collector =
            ClusterCollector::new(weights, StateRules::default(), Some("kemp".to_string()));
        let dump = "NodeName=kempg01 CPUTot=8 CPUAlloc=0 RealMemory=100 AllocMem=0 State=IDLE\n\
                    NodeName=other01 CPUTot=8 CPUAlloc=0 RealMemory=100 AllocMem=0 State=IDLE\n";
        let family = collector.collect(dump);
        assert_eq!(family.value(&["nodetot"]), Some(1.0));
    }
}
