//! Daily accounting merge engine
//!
//! Consumes pipe-delimited `sacct` day batches and maintains persisted
//! per-user, per-account and per-partition resource-hour tables under a
//! state directory: a `processed_dates.log` (one ISO date per line), a
//! daily table per scope (overwritten each processed day) and a cumulative
//! table per scope (merged additively, never pruned). A date already in the
//! log is never reprocessed, which makes the merge idempotent across
//! retries and restarts.

use crate::snapshot::{MetricFamily, Snapshot};
use crate::tres::TresMap;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Scopes the engine keeps separate hour tables for.
const SCOPES: [&str; 3] = ["user", "account", "partition"];

/// Settings for the accounting merge engine.
#[derive(Debug, Clone)]
pub struct AccountingConfig {
    /// Directory holding the dates log and the hour tables.
    pub state_dir: PathBuf,
    /// Accounts are tracked only when their name carries this prefix; the
    /// same prefix decides whether a partition is "ours".
    pub account_prefix: String,
    /// Prefix for the synthetic catch-all partition entities
    /// (`<prefix>_h100`, `<prefix>_cpu`, ...).
    pub external_entity_prefix: String,
    /// GPU model -> weight factor for `gpu_tres_hours`.
    pub gpu_weights: HashMap<String, f64>,
}

/// Resource-hours accrued by one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageHours {
    pub cpu_hours: f64,
    pub gpu_hours: f64,
    pub gpu_tres_hours: f64,
}

impl UsageHours {
    fn add(&mut self, other: UsageHours) {
        self.cpu_hours += other.cpu_hours;
        self.gpu_hours += other.gpu_hours;
        self.gpu_tres_hours += other.gpu_tres_hours;
    }
}

type Table = BTreeMap<String, UsageHours>;

/// One day's hour tables across all three scopes.
#[derive(Debug, Default)]
pub struct DayUsage {
    pub user: Table,
    pub account: Table,
    pub partition: Table,
}

impl DayUsage {
    fn scope(&self, name: &str) -> &Table {
        match name {
            "user" => &self.user,
            "account" => &self.account,
            _ => &self.partition,
        }
    }
}

/// The merge engine. All I/O stays under `config.state_dir`.
#[derive(Debug, Clone)]
pub struct AccountingEngine {
    config: AccountingConfig,
}

impl AccountingEngine {
    pub fn new(config: AccountingConfig) -> Self {
        Self { config }
    }

    /// Calendar dates from the oldest logged date through yesterday that
    /// are absent from the processed-dates log, oldest first. An absent or
    /// empty log seeds the backlog with yesterday alone.
    pub fn missing_dates(&self, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let yesterday = today
            .pred_opt()
            .context("no calendar day before the epoch")?;
        let processed = self.read_dates_log()?;
        let Some(oldest) = processed.iter().next().copied() else {
            return Ok(vec![yesterday]);
        };
        let mut missing = Vec::new();
        let mut date = oldest;
        while date <= yesterday {
            if !processed.contains(&date) {
                missing.push(date);
            }
            date = date.succ_opt().context("calendar overflow")?;
        }
        Ok(missing)
    }

    /// Compute one day's tables from a `sacct -p` batch. Pure; rows in a
    /// live state (RUNNING/PENDING) or malformed rows are dropped.
    pub fn day_usage(&self, batch: &str, watched_nodes: &[String]) -> DayUsage {
        let mut usage = DayUsage::default();
        for line in batch.lines() {
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 12 || fields[0] == "JobID" {
                continue;
            }
            let state = fields[1];
            if state.contains("RUNNING") || state.contains("PENDING") {
                continue;
            }
            let Some(elapsed_hours) = parse_elapsed_hours(fields[5]) else {
                debug!(row = line, "dropping row with unparsable elapsed time");
                continue;
            };
            let Ok(cpu_count) = fields[11].trim().parse::<u64>() else {
                debug!(row = line, "dropping row with unparsable CPU count");
                continue;
            };

            let alloc = TresMap::from_str(fields[6]);
            let gpu_count = alloc.gpus();
            let factor = alloc.gpu_weight(&self.config.gpu_weights);
            let hours = UsageHours {
                cpu_hours: elapsed_hours * cpu_count as f64,
                gpu_hours: elapsed_hours * gpu_count as f64,
                gpu_tres_hours: elapsed_hours * gpu_count as f64 * factor,
            };

            let user = fields[2].trim();
            let account = fields[3].split(',').next().unwrap_or("").trim();
            let partition = fields[4].split(',').next().unwrap_or("").trim();
            let node_list = fields[7].trim();

            if !user.is_empty() {
                usage.user.entry(user.to_string()).or_default().add(hours);
            }
            if account.contains(&self.config.account_prefix) {
                usage
                    .account
                    .entry(account.to_string())
                    .or_default()
                    .add(hours);
            }
            let entity = self.partition_entity(partition, node_list, &alloc, watched_nodes);
            if !entity.is_empty() {
                usage.partition.entry(entity).or_default().add(hours);
            }
        }
        usage
    }

    /// Merge one day's batch into the persisted tables and mark the date
    /// processed. A date already in the log is a no-op.
    pub fn merge_day(&self, date: NaiveDate, batch: &str, watched_nodes: &[String]) -> Result<()> {
        if self.read_dates_log()?.contains(&date) {
            debug!(%date, "date already processed, skipping merge");
            return Ok(());
        }
        fs::create_dir_all(&self.config.state_dir).with_context(|| {
            format!(
                "creating accounting state dir {}",
                self.config.state_dir.display()
            )
        })?;

        let usage = self.day_usage(batch, watched_nodes);
        for scope in SCOPES {
            let day_table = usage.scope(scope);
            store_table(&self.table_path(scope, "daily"), day_table)?;

            let total_path = self.table_path(scope, "cumulative");
            let mut total = load_table(&total_path)?;
            for (name, hours) in day_table {
                total.entry(name.clone()).or_default().add(*hours);
            }
            store_table(&total_path, &total)?;
        }
        self.append_dates_log(date)?;
        info!(%date, users = usage.user.len(), partitions = usage.partition.len(),
              "merged accounting day");
        Ok(())
    }

    /// Gauge families from the persisted tables: `susage_day` (last merged
    /// day) and `susage_total` (cumulative), labeled by scope and entity.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let labels = ["scope", "name", "field"];
        let mut day = MetricFamily::new("susage_day", "Daily resource hours", &labels);
        let mut total = MetricFamily::new("susage_total", "Cumulative resource hours", &labels);
        for scope in SCOPES {
            for (family, variant) in [(&mut day, "daily"), (&mut total, "cumulative")] {
                let table = load_table(&self.table_path(scope, variant))?;
                for (name, hours) in &table {
                    let sample = |field: &str| {
                        vec![scope.to_string(), name.clone(), field.to_string()]
                    };
                    family.push(sample("cpu"), hours.cpu_hours);
                    family.push(sample("gpu"), hours.gpu_hours);
                    family.push(sample("gputres"), hours.gpu_tres_hours);
                }
            }
        }
        Ok(vec![day, total])
    }

    /// Entity a job's hours land under in the partition table. A job that
    /// ran on watched hardware through a partition outside our namespace is
    /// folded into a synthetic catch-all named after the GPU generation it
    /// used (or `_cpu` without one).
    fn partition_entity(
        &self,
        partition: &str,
        node_list: &str,
        alloc: &TresMap,
        watched_nodes: &[String],
    ) -> String {
        if partition.contains(&self.config.account_prefix) {
            return partition.to_string();
        }
        if !on_watched_node(node_list, watched_nodes) {
            return partition.to_string();
        }
        let suffix = alloc
            .matched_gpu_generation(&self.config.gpu_weights)
            .unwrap_or_else(|| "cpu".to_string());
        format!("{}_{}", self.config.external_entity_prefix, suffix)
    }

    fn table_path(&self, scope: &str, variant: &str) -> PathBuf {
        self.config.state_dir.join(format!("{scope}_{variant}.csv"))
    }

    fn dates_log_path(&self) -> PathBuf {
        self.config.state_dir.join("processed_dates.log")
    }

    fn read_dates_log(&self) -> Result<BTreeSet<NaiveDate>> {
        let path = self.dates_log_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(error) => {
                return Err(error).with_context(|| format!("reading {}", path.display()));
            }
        };
        let mut dates = BTreeSet::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<NaiveDate>() {
                Ok(date) => {
                    dates.insert(date);
                }
                Err(_) => warn!(line, "skipping malformed dates-log entry"),
            }
        }
        Ok(dates)
    }

    fn append_dates_log(&self, date: NaiveDate) -> Result<()> {
        let path = self.dates_log_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        writeln!(file, "{date}").with_context(|| format!("appending to {}", path.display()))?;
        Ok(())
    }
}

/// Elapsed time in fractional hours from `D-HH:MM:SS` or `HH:MM:SS`.
pub fn parse_elapsed_hours(raw: &str) -> Option<f64> {
    let (days, clock) = match raw.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, raw),
    };
    let mut parts = clock.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(days as f64 * 24.0 + hours as f64 + minutes as f64 / 60.0 + seconds as f64 / 3600.0)
}

/// A job counts as running on watched hardware when its node list names at
/// least one watched node. Compact lists are expanded first; an expression
/// the expansion rejects is compared as a literal name.
fn on_watched_node(node_list: &str, watched_nodes: &[String]) -> bool {
    let hosts = match crate::hostlist::expand(node_list) {
        Ok(hosts) => hosts,
        Err(_) => vec![node_list.to_string()],
    };
    hosts
        .iter()
        .any(|host| watched_nodes.iter().any(|watched| watched == host))
}

fn load_table(path: &Path) -> Result<Table> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Table::new()),
        Err(error) => return Err(error).with_context(|| format!("reading {}", path.display())),
    };
    let mut table = Table::new();
    for line in content.lines() {
        let mut parts = line.split('|');
        let (Some(name), Some(cpu), Some(gpu), Some(gputres)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            warn!(line, path = %path.display(), "skipping malformed table row");
            continue;
        };
        let parse = |v: &str| v.trim().parse::<f64>().unwrap_or(0.0);
        table.insert(
            name.to_string(),
            UsageHours {
                cpu_hours: parse(cpu),
                gpu_hours: parse(gpu),
                gpu_tres_hours: parse(gputres),
            },
        );
    }
    Ok(table)
}

fn store_table(path: &Path, table: &Table) -> Result<()> {
    let mut out = String::new();
    for (name, hours) in table {
        out.push_str(&format!(
            "{name}|{}|{}|{}\n",
            hours.cpu_hours, hours.gpu_hours, hours.gpu_tres_hours
        ));
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}
