//! Slurm command invocation
//!
//! Implements the library's source traits over the real command-line
//! tools. Every invocation runs under a hard timeout; a hung scheduler
//! command aborts the current cycle instead of stalling the exporter.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use collector_lib::hostlist;
use collector_lib::source::{AccountingSource, SchedulerSource};
use std::collections::HashSet;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const SACCT_FORMAT: &str = "JobID,State,User,Account,Partition,Elapsed,AllocTRES,NodeList,\
                            ReqMem,MaxRSS,ExitCode,NCPUs,TotalCPU,CPUTime,ReqTRES,Start,End";

/// Command-line access to the scheduler.
#[derive(Debug, Clone)]
pub struct SlurmTool {
    timeout: Duration,
    lookback_days: i64,
    watched_partition: String,
}

impl SlurmTool {
    pub fn new(timeout: Duration, lookback_days: i64, watched_partition: String) -> Self {
        Self {
            timeout,
            lookback_days,
            watched_partition,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "invoking scheduler command");
        let output = tokio::time::timeout(self.timeout, Command::new(program).args(args).output())
            .await
            .with_context(|| format!("{program} timed out after {:?}", self.timeout))?
            .with_context(|| format!("spawning {program}"))?;
        if !output.status.success() {
            bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SchedulerSource for SlurmTool {
    async fn show_nodes(&self) -> Result<String> {
        self.run("scontrol", &["-o", "show", "node"]).await
    }

    async fn show_partitions(&self) -> Result<String> {
        self.run("scontrol", &["-o", "show", "partition"]).await
    }

    async fn show_jobs(&self) -> Result<String> {
        self.run("scontrol", &["-od", "show", "job"]).await
    }

    async fn expand_hostnames(&self, expr: &str) -> Result<Vec<String>> {
        let raw = self.run("scontrol", &["show", "hostnames", expr]).await?;
        Ok(raw.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl AccountingSource for SlurmTool {
    async fn day_batch(&self, date: NaiveDate) -> Result<String> {
        let end = date.to_string();
        let start = (date - chrono::Duration::days(self.lookback_days)).to_string();
        let format = format!("--format={SACCT_FORMAT}");
        let raw = self
            .run(
                "sacct",
                &["-S", &start, "-E", &end, "--allusers", "-X", "-p", &format],
            )
            .await?;
        Ok(filter_day_rows(&raw, &end))
    }

    async fn watched_nodes(&self) -> Result<Vec<String>> {
        let raw = self
            .run("sinfo", &["-h", "-p", &self.watched_partition, "-o", "%N"])
            .await?;
        let mut nodes = Vec::new();
        for expr in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match hostlist::expand(expr) {
                Ok(hosts) => nodes.extend(hosts),
                Err(_) => nodes.extend(self.expand_hostnames(expr).await?),
            }
        }
        Ok(nodes)
    }
}

/// Keep exactly the rows of jobs that ended on `end_date`, dropping
/// duplicates. The sacct window starts days earlier so long jobs appear;
/// everything still running or ended on another day is discarded. The
/// end-time column sits before the trailing delimiter of each `-p` row.
fn filter_day_rows(raw: &str, end_date: &str) -> String {
    let mut seen = HashSet::new();
    let mut out = String::new();
    for line in raw.lines() {
        if !seen.insert(line) {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 2 {
            continue;
        }
        let end_field = fields[fields.len() - 2];
        if end_field.split('T').next() == Some(end_date) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_day_rows_keeps_matching_end_date() {
        let raw = "\
1|COMPLETED|alice|lab|p|01:00:00|cpu=1|n1|1G||0:0|1|||cpu=1|2024-01-01T00:00:00|2024-01-02T01:00:00|\n\
2|COMPLETED|bob|lab|p|01:00:00|cpu=1|n1|1G||0:0|1|||cpu=1|2024-01-01T00:00:00|2024-01-03T01:00:00|\n\
3|RUNNING|carol|lab|p|01:00:00|cpu=1|n1|1G||0:0|1|||cpu=1|2024-01-01T00:00:00|Unknown|\n";
        let filtered = filter_day_rows(raw, "2024-01-02");
        assert!(filtered.contains("1|COMPLETED"));
        assert!(!filtered.contains("2|COMPLETED"));
        assert!(!filtered.contains("RUNNING"));
    }

    #[test]
    fn test_filter_day_rows_dedups() {
        let row = "1|COMPLETED|alice|lab|p|01:00:00|cpu=1|n1|1G||0:0|1|||cpu=1|\
                   2024-01-01T00:00:00|2024-01-02T01:00:00|\n";
        let raw = format!("{row}{row}");
        let filtered = filter_day_rows(&raw, "2024-01-02");
        assert_eq!(filtered.lines().count(), 1);
    }
}
