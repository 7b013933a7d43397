//! Per-partition aggregation
//!
//! Joins three dumps (`scontrol -o show partition`, `scontrol -o show
//! node`, `scontrol -od show job`) into the `spart` gauge family: capacity
//! and billing weights per partition, reserved/down/powered-down rollups,
//! running and pending job totals per partition/user/account, per-node
//! occupancy sums and priority-relative contention between partitions that
//! share nodes.

use crate::hardware::billing_score;
use crate::record::{job_node_segments, RawRecord};
use crate::snapshot::MetricFamily;
use crate::source::HostlistExpander;
use crate::state::token_flags;
use crate::tres::TresMap;
use crate::units::MemUnit;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Node-count/CPU/memory/GPU sums for one state rollup.
#[derive(Debug, Clone, Copy, Default)]
struct ResourceSums {
    nodes: f64,
    cpu: f64,
    mem_gb: f64,
    gpu: f64,
}

/// Allocated CPU/memory/GPU on one node attributed to one partition.
#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    cpu: f64,
    mem_gb: f64,
    gpu: f64,
}

impl Usage {
    fn add(&mut self, other: Usage) {
        self.cpu += other.cpu;
        self.mem_gb += other.mem_gb;
        self.gpu += other.gpu;
    }
}

/// Running-job totals for one user or account within a partition.
#[derive(Debug, Clone, Copy, Default)]
struct EntityUse {
    jobs: f64,
    cpu: f64,
    mem_gb: f64,
    gpu: f64,
}

#[derive(Debug, Default)]
struct PartitionStats {
    priority_tier: i64,
    cpu: f64,
    mem_gb: f64,
    gpu: f64,
    nodes: f64,
    weight_cpu: f64,
    weight_mem: f64,
    weight_gpu: f64,
    reserved: ResourceSums,
    down: ResourceSums,
    powered_down: ResourceSums,
    run_cpu: f64,
    run_mem_gb: f64,
    run_gpu: f64,
    run_jobs: f64,
    pending_jobs: f64,
    restarts: f64,
    occupancy: f64,
    higher: Usage,
    lower: Usage,
    pending_by_user: BTreeMap<String, f64>,
    pending_by_account: BTreeMap<String, f64>,
    running_by_user: BTreeMap<String, EntityUse>,
    running_by_account: BTreeMap<String, EntityUse>,
}

/// One node's capacity, partition membership and attributed job usage.
#[derive(Debug, Default)]
struct NodeInfo {
    cpu: f64,
    mem_gb: f64,
    gpu: f64,
    partitions: Vec<String>,
    usage: HashMap<String, Usage>,
}

/// Aggregates partition, node and job dumps into per-partition gauges.
#[derive(Debug, Clone)]
pub struct PartitionCollector {
    tres_to_gflops: f64,
}

impl PartitionCollector {
    pub fn new(tres_to_gflops: f64) -> Self {
        Self { tres_to_gflops }
    }

    pub fn collect(
        &self,
        partition_dump: &str,
        node_dump: &str,
        job_dump: &str,
        expander: &dyn HostlistExpander,
    ) -> MetricFamily {
        let mut stats: BTreeMap<String, PartitionStats> = BTreeMap::new();

        for line in partition_dump.lines() {
            let record = RawRecord::parse(line);
            let Some(name) = record.get("PartitionName") else {
                continue;
            };
            let tres = TresMap::from_field(&record, "TRES");
            let weights = record.subrecord("TRESBillingWeights");
            let strip_g = |v: &String| v.trim_end_matches(['G', 'g']).parse().unwrap_or(0.0);
            stats.insert(
                name.to_string(),
                PartitionStats {
                    priority_tier: record
                        .get("PriorityTier")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    cpu: tres.cpus() as f64,
                    mem_gb: tres.mem(MemUnit::Gigabytes),
                    gpu: tres.gpus() as f64,
                    nodes: tres.nodes() as f64,
                    weight_cpu: weights.get("CPU").and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    weight_mem: weights.get("Mem").map(strip_g).unwrap_or(0.0),
                    weight_gpu: weights
                        .get("Gres/gpu")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0.0),
                    ..PartitionStats::default()
                },
            );
        }
        let tiers: HashMap<String, i64> = stats
            .iter()
            .map(|(name, s)| (name.clone(), s.priority_tier))
            .collect();

        let mut nodes: BTreeMap<String, NodeInfo> = BTreeMap::new();
        for line in node_dump.lines() {
            let record = RawRecord::parse(line);
            let Some(name) = record.get("NodeName") else {
                continue;
            };
            let cfg = TresMap::from_field(&record, "CfgTRES");
            let info = NodeInfo {
                cpu: cfg.cpus() as f64,
                mem_gb: cfg.mem(MemUnit::Gigabytes),
                gpu: cfg.gpus() as f64,
                partitions: record.list("Partitions"),
                usage: record
                    .list("Partitions")
                    .into_iter()
                    .map(|p| (p, Usage::default()))
                    .collect(),
            };

            let flags = token_flags(record.str_or("State", ""));
            for part in &info.partitions {
                // A node can reference a partition the partition dump does
                // not know; skip it rather than invent an entry.
                let Some(p) = stats.get_mut(part) else {
                    debug!(node = name, partition = %part, "node references unknown partition");
                    continue;
                };
                for (flagged, sums) in [
                    (flags.reserved, &mut p.reserved),
                    (flags.down, &mut p.down),
                    (flags.powered_down, &mut p.powered_down),
                ] {
                    if flagged {
                        sums.nodes += 1.0;
                        sums.cpu += info.cpu;
                        sums.mem_gb += info.mem_gb;
                        sums.gpu += info.gpu;
                    }
                }
            }
            nodes.insert(name.to_string(), info);
        }

        for line in job_dump.lines() {
            let record = RawRecord::parse(line);
            let Some(user) = record.get("UserId").map(str::to_string) else {
                continue;
            };
            let account = record.str_or("Account", "").to_string();
            let job_partitions = record.list("Partition");
            let job_state = record.str_or("JobState", "");

            // Scheduler-driven cron entries restart by design; counting
            // them would drown real requeue events.
            if !record.has("CronJob") {
                let restarts = record.u64_or("Restarts", 0) as f64;
                for part in &job_partitions {
                    if let Some(p) = stats.get_mut(part) {
                        p.restarts += restarts;
                    }
                }
            }

            if job_state.contains("PENDING") {
                let job_count = match record.get("ArrayTaskId") {
                    Some(task_ids) => pending_task_count(task_ids),
                    None => 1.0,
                };
                for part in &job_partitions {
                    let Some(p) = stats.get_mut(part) else {
                        continue;
                    };
                    p.pending_jobs += job_count;
                    *p.pending_by_user.entry(user.clone()).or_default() += job_count;
                    *p.pending_by_account.entry(account.clone()).or_default() += job_count;
                }
            }

            if job_state.contains("RUNNING") {
                let alloc = TresMap::from_field(&record, "AllocTRES");
                let cpu = alloc.cpus() as f64;
                let mem_gb = alloc.mem(MemUnit::Gigabytes);
                let gpu = alloc.gpus() as f64;

                for part in &job_partitions {
                    {
                        let Some(p) = stats.get_mut(part) else {
                            continue;
                        };
                        p.run_cpu += cpu;
                        p.run_mem_gb += mem_gb;
                        p.run_gpu += gpu;
                        p.run_jobs += 1.0;
                        let by_user = p.running_by_user.entry(user.clone()).or_default();
                        by_user.jobs += 1.0;
                        by_user.cpu += cpu;
                        by_user.mem_gb += mem_gb;
                        by_user.gpu += gpu;
                        let by_account = p.running_by_account.entry(account.clone()).or_default();
                        by_account.jobs += 1.0;
                        by_account.cpu += cpu;
                        by_account.mem_gb += mem_gb;
                        by_account.gpu += gpu;
                    }

                    for segment in job_node_segments(line) {
                        let Some(expr) = segment.get("Nodes") else {
                            continue;
                        };
                        let contribution = Usage {
                            cpu: cpu_id_count(segment.str_or("CPU_IDs", "")),
                            mem_gb: segment.f64_opt("Mem").unwrap_or(0.0) / 1024.0,
                            gpu: gres_gpu_count(segment.str_or("GRES", "")),
                        };
                        self.attribute_segment(&mut nodes, expr, part, contribution, expander);
                    }
                }
            }
        }

        // Node-based sums: occupancy and priority-relative contention.
        for info in nodes.values() {
            let inv_cpu = if info.cpu > 0.0 { 1.0 / info.cpu } else { 0.0 };
            let inv_mem = if info.mem_gb > 0.0 {
                1.0 / info.mem_gb
            } else {
                0.0
            };
            let inv_gpu = 1.0 / info.gpu.max(1.0);

            for part in &info.partitions {
                let Some(current_tier) = tiers.get(part) else {
                    continue;
                };
                let used = info.usage[part];
                let node_occ = (used.cpu * inv_cpu)
                    .max(used.mem_gb * inv_mem)
                    .max(used.gpu * inv_gpu);

                let mut higher = Usage::default();
                let mut lower = Usage::default();
                for other in &info.partitions {
                    if other == part {
                        continue;
                    }
                    let Some(other_tier) = tiers.get(other) else {
                        continue;
                    };
                    // Equal tiers count as contention from above.
                    if other_tier < current_tier {
                        lower.add(info.usage[other]);
                    } else {
                        higher.add(info.usage[other]);
                    }
                }

                let Some(p) = stats.get_mut(part) else {
                    continue;
                };
                p.occupancy += node_occ;
                p.higher.add(higher);
                p.lower.add(lower);
            }
        }

        self.emit(&stats)
    }

    /// Attribute one per-node resource group to (node, partition). The
    /// `Nodes` value may be a single name or a compact list needing
    /// expansion. A (node, partition) pair unknown to the node dump is a
    /// leftover from a partition move; its contribution is dropped.
    fn attribute_segment(
        &self,
        nodes: &mut BTreeMap<String, NodeInfo>,
        expr: &str,
        part: &str,
        contribution: Usage,
        expander: &dyn HostlistExpander,
    ) {
        if let Some(info) = nodes.get_mut(expr) {
            if let Some(used) = info.usage.get_mut(part) {
                used.add(contribution);
                return;
            }
        }
        match expander.expand(expr) {
            Ok(hosts) => {
                for host in hosts {
                    if let Some(used) = nodes
                        .get_mut(&host)
                        .and_then(|info| info.usage.get_mut(part))
                    {
                        used.add(contribution);
                    }
                }
            }
            Err(error) => {
                debug!(expr, %error, "dropping unexpandable node list");
            }
        }
    }

    fn emit(&self, stats: &BTreeMap<String, PartitionStats>) -> MetricFamily {
        let mut family = MetricFamily::new(
            "spart",
            "Partition stats",
            &["partition", "user", "account", "field"],
        );
        let sample = |p: &str, user: &str, account: &str, field: &str| {
            vec![
                p.to_string(),
                user.to_string(),
                account.to_string(),
                field.to_string(),
            ]
        };

        for (name, p) in stats {
            let mut push = |field: &str, value: f64| {
                family.push(sample(name, "", "", field), value);
            };
            push("cpu", p.cpu);
            push("mem", p.mem_gb);
            push("gpu", p.gpu);
            push("node", p.nodes);
            push("rescpu", p.reserved.cpu);
            push("resmem", p.reserved.mem_gb);
            push("resgpu", p.reserved.gpu);
            push("resnode", p.reserved.nodes);
            push("downcpu", p.down.cpu);
            push("downmem", p.down.mem_gb);
            push("downgpu", p.down.gpu);
            push("downnode", p.down.nodes);
            push("pwdcpu", p.powered_down.cpu);
            push("pwdmem", p.powered_down.mem_gb);
            push("pwdgpu", p.powered_down.gpu);
            push("pwdnode", p.powered_down.nodes);
            push("perdown", p.down.nodes / p.nodes.max(1.0));
            push("perres", p.reserved.nodes / p.nodes.max(1.0));
            push("runcpu", p.run_cpu);
            push("runmem", p.run_mem_gb);
            push("rungpu", p.run_gpu);
            push("occ", p.occupancy);
            push("perocc", p.occupancy / p.nodes.max(1.0));
            push("hcpu", p.higher.cpu);
            push("hmem", p.higher.mem_gb);
            push("hgpu", p.higher.gpu);
            push("lcpu", p.lower.cpu);
            push("lmem", p.lower.mem_gb);
            push("lgpu", p.lower.gpu);
            push("pendcnt", p.pending_jobs);
            push("pendusercnt", p.pending_by_user.len() as f64);
            push("pendacctcnt", p.pending_by_account.len() as f64);
            push("runcnt", p.run_jobs);
            push("runusercnt", p.running_by_user.len() as f64);
            push("runacctcnt", p.running_by_account.len() as f64);
            push("restarts", p.restarts);

            let tres_cpu = p.weight_cpu * p.cpu;
            let tres_mem = p.weight_mem * p.mem_gb;
            let tres_gpu = p.weight_gpu * p.gpu;
            let tres_run_cpu = p.weight_cpu * p.run_cpu;
            let tres_run_mem = p.weight_mem * p.run_mem_gb;
            let tres_run_gpu = p.weight_gpu * p.run_gpu;
            push("trescpu", tres_cpu);
            push("tresmem", tres_mem);
            push("tresgpu", tres_gpu);
            push("trestot", tres_cpu + tres_mem + tres_gpu);
            push("tresruncpu", tres_run_cpu);
            push("tresrunmem", tres_run_mem);
            push("tresrungpu", tres_run_gpu);
            push("tresruntot", tres_run_cpu + tres_run_mem + tres_run_gpu);
            let t2g = self.tres_to_gflops;
            push("flopscpu", t2g * tres_cpu);
            push("flopsgpu", t2g * tres_gpu);
            push("flopstot", t2g * (tres_cpu + tres_gpu));
            push("flopsruncpu", t2g * tres_run_cpu);
            push("flopsrungpu", t2g * tres_run_gpu);
            push("flopsruntot", t2g * (tres_run_cpu + tres_run_gpu));

            // Per-user and per-account detail. Idle partitions still expose
            // every field through a zero placeholder sample so dashboards
            // never query a missing series.
            if p.pending_by_user.is_empty() {
                family.push(sample(name, "root(0)", "", "penduser"), 0.0);
            } else {
                for (user, count) in &p.pending_by_user {
                    family.push(sample(name, user, "", "penduser"), *count);
                }
            }
            if p.running_by_user.is_empty() {
                for field in ["runuser", "cpuuser", "memuser", "gpuuser", "tresuser"] {
                    family.push(sample(name, "root(0)", "", field), 0.0);
                }
            } else {
                for (user, used) in &p.running_by_user {
                    family.push(sample(name, user, "", "runuser"), used.jobs);
                    family.push(sample(name, user, "", "cpuuser"), used.cpu);
                    family.push(sample(name, user, "", "memuser"), used.mem_gb);
                    family.push(sample(name, user, "", "gpuuser"), used.gpu);
                    let tres = billing_score(
                        p.weight_cpu,
                        p.weight_mem,
                        p.weight_gpu,
                        used.cpu,
                        used.mem_gb,
                        used.gpu,
                    );
                    family.push(sample(name, user, "", "tresuser"), tres);
                }
            }
            if p.pending_by_account.is_empty() {
                family.push(sample(name, "", "root", "pendacct"), 0.0);
            } else {
                for (account, count) in &p.pending_by_account {
                    family.push(sample(name, "", account, "pendacct"), *count);
                }
            }
            if p.running_by_account.is_empty() {
                for field in ["runacct", "cpuacct", "memacct", "gpuacct", "tresacct"] {
                    family.push(sample(name, "", "root", field), 0.0);
                }
            } else {
                for (account, used) in &p.running_by_account {
                    family.push(sample(name, "", account, "runacct"), used.jobs);
                    family.push(sample(name, "", account, "cpuacct"), used.cpu);
                    family.push(sample(name, "", account, "memacct"), used.mem_gb);
                    family.push(sample(name, "", account, "gpuacct"), used.gpu);
                    let tres = billing_score(
                        p.weight_cpu,
                        p.weight_mem,
                        p.weight_gpu,
                        used.cpu,
                        used.mem_gb,
                        used.gpu,
                    );
                    family.push(sample(name, "", account, "tresacct"), tres);
                }
            }
        }
        family
    }
}

/// Pending-job-equivalents for an array job's task-ID field.
///
/// Each comma-separated component drops its `%<limit>` and `:<step>`
/// suffixes, then a range `a-b` contributes `max(b-a, 1) + 1` and a single
/// task contributes 1. The range arithmetic ignores the step, so a strided
/// range reads as its unstrided width; operators should treat the pending
/// count as approximate for strided arrays.
fn pending_task_count(raw: &str) -> f64 {
    let mut count: i64 = 0;
    for component in raw.trim_matches('.').split(',') {
        let t = component.split('%').next().unwrap_or("");
        let t = t.split(':').next().unwrap_or("");
        let t = t.trim_matches('.');
        match t.split_once('-') {
            Some((lo, hi)) => {
                let lo: i64 = lo.parse().unwrap_or(0);
                let hi: i64 = if hi.is_empty() {
                    0
                } else {
                    hi.parse().unwrap_or(0)
                };
                count += (hi - lo).max(1) + 1;
            }
            None => count += 1,
        }
    }
    count.max(0) as f64
}

/// Count CPUs from a `CPU_IDs` list such as `0-15,32-47`; ranges are
/// inclusive.
fn cpu_id_count(raw: &str) -> f64 {
    let mut count: i64 = 0;
    for component in raw.split(',') {
        match component.split_once('-') {
            Some((lo, hi)) => {
                let lo: i64 = lo.parse().unwrap_or(0);
                let hi: i64 = hi.parse().unwrap_or(0);
                count += hi - lo + 1;
            }
            None => count += 1,
        }
    }
    count.max(0) as f64
}

/// GPU count from a per-node `GRES` value such as `gpu:h100:4(IDX:0-3)`.
fn gres_gpu_count(raw: &str) -> f64 {
    if !raw.contains("gpu") {
        return 0.0;
    }
    raw.split(':')
        .nth(2)
        .map(|count| count.trim_matches(|c| "(IDX".contains(c)))
        .and_then(|count| count.parse().ok())
        .unwrap_or(0.0)
}
