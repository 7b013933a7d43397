//! Periodic collection loops
//!
//! Two independent tickers: a live snapshot loop joining the node,
//! partition and job dumps, and a daily accounting loop draining the
//! missing-dates backlog. A failed cycle is skipped with a warning and the
//! previously published gauges keep serving scrapes.

use crate::health::{components, HealthRegistry};
use crate::publish::{ExporterMetrics, Publisher};
use anyhow::{Context, Result};
use collector_lib::record::job_node_segments;
use collector_lib::source::CachedExpander;
use collector_lib::{
    hostlist, AccountingEngine, AccountingSource, ClusterCollector, PartitionCollector,
    SchedulerSource,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// The live snapshot loop: cluster and partition aggregation.
pub struct SnapshotLoop {
    pub source: Arc<dyn SchedulerSource>,
    pub cluster: ClusterCollector,
    pub partition: PartitionCollector,
    pub publisher: Arc<Publisher>,
    pub metrics: ExporterMetrics,
    pub health: HealthRegistry,
    pub interval: Duration,
}

impl SnapshotLoop {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "starting snapshot loop");
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    match self.cycle().await {
                        Ok(()) => {
                            self.health.set_healthy(components::SNAPSHOT).await;
                        }
                        Err(error) => {
                            warn!(%error, "snapshot cycle failed, keeping previous gauges");
                            self.metrics.inc_cycle_errors("snapshot");
                            self.health
                                .set_degraded(components::SNAPSHOT, error.to_string())
                                .await;
                        }
                    }
                    self.metrics
                        .observe_cycle("snapshot", start.elapsed().as_secs_f64());
                }
                _ = shutdown.recv() => {
                    info!("shutting down snapshot loop");
                    break;
                }
            }
        }
    }

    async fn cycle(&self) -> Result<()> {
        let nodes = self.source.show_nodes().await?;
        let partitions = self.source.show_partitions().await?;
        let jobs = self.source.show_jobs().await?;
        let expander = self.resolve_hostlists(&jobs).await;

        let snapshot = vec![
            self.cluster.collect(&nodes),
            self.partition.collect(&partitions, &nodes, &jobs, &expander),
        ];
        self.publisher.publish(&snapshot)
    }

    /// Pre-resolve the node-list expressions in a job dump that the
    /// built-in bracket expansion cannot handle, so the synchronous
    /// aggregation pass never has to call out itself.
    async fn resolve_hostlists(&self, jobs: &str) -> CachedExpander {
        let mut resolved: HashMap<String, Vec<String>> = HashMap::new();
        for line in jobs.lines() {
            for segment in job_node_segments(line) {
                let Some(expr) = segment.get("Nodes") else {
                    continue;
                };
                if resolved.contains_key(expr) || hostlist::expand(expr).is_ok() {
                    continue;
                }
                match self.source.expand_hostnames(expr).await {
                    Ok(hosts) => {
                        resolved.insert(expr.to_string(), hosts);
                    }
                    Err(error) => {
                        // The aggregation drops this contribution.
                        debug!(expr, %error, "hostname expansion failed");
                    }
                }
            }
        }
        CachedExpander::new(resolved)
    }
}

/// The daily accounting loop: missing-date backlog merge and republish.
pub struct AccountingLoop {
    pub source: Arc<dyn AccountingSource>,
    pub engine: AccountingEngine,
    pub publisher: Arc<Publisher>,
    pub metrics: ExporterMetrics,
    pub health: HealthRegistry,
    pub interval: Duration,
}

impl AccountingLoop {
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting accounting loop"
        );
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    match self.cycle().await {
                        Ok(()) => {
                            self.health.set_healthy(components::ACCOUNTING).await;
                        }
                        Err(error) => {
                            warn!(%error, "accounting cycle failed, will retry next interval");
                            self.metrics.inc_cycle_errors("accounting");
                            self.health
                                .set_degraded(components::ACCOUNTING, error.to_string())
                                .await;
                        }
                    }
                    self.metrics
                        .observe_cycle("accounting", start.elapsed().as_secs_f64());
                }
                _ = shutdown.recv() => {
                    info!("shutting down accounting loop");
                    break;
                }
            }
        }
    }

    async fn cycle(&self) -> Result<()> {
        let today = chrono::Local::now().date_naive();
        let missing = self.engine.missing_dates(today)?;
        if missing.is_empty() {
            debug!("no missing accounting dates");
        } else {
            let watched = self
                .source
                .watched_nodes()
                .await
                .context("listing watched nodes")?;
            for date in missing {
                let batch = self
                    .source
                    .day_batch(date)
                    .await
                    .with_context(|| format!("fetching accounting batch for {date}"))?;
                self.engine.merge_day(date, &batch, &watched)?;
            }
        }
        self.publisher.publish(&self.engine.snapshot()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use collector_lib::source::HostlistExpander;

    struct FakeScheduler;

    #[async_trait]
    impl SchedulerSource for FakeScheduler {
        async fn show_nodes(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn show_partitions(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn show_jobs(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn expand_hostnames(&self, expr: &str) -> Result<Vec<String>> {
            if expr == "oddlist" {
                Ok(vec!["n7".to_string(), "n8".to_string()])
            } else {
                Err(anyhow!("unknown expression"))
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_hostlists_only_for_rejected_exprs() {
        let snapshot_loop = SnapshotLoop {
            source: Arc::new(FakeScheduler),
            cluster: ClusterCollector::new(Default::default(), Default::default(), None),
            partition: PartitionCollector::new(93.25),
            publisher: Arc::new(Publisher::new()),
            metrics: ExporterMetrics::new(),
            health: HealthRegistry::new(),
            interval: Duration::from_secs(55),
        };
        let jobs = "JobId=1 JobState=RUNNING NumNodes=3  \
                    Nodes=n[1-2] CPU_IDs=0 Mem=1024 GRES=  \
                    Nodes=oddlist CPU_IDs=0 Mem=1024 GRES=\n";
        let expander = snapshot_loop.resolve_hostlists(jobs).await;
        // Bracket forms expand locally; the rejected form came from the
        // scheduler.
        assert_eq!(expander.expand("n[1-2]").unwrap(), vec!["n1", "n2"]);
        assert_eq!(expander.expand("oddlist").unwrap(), vec!["n7", "n8"]);
    }

    struct FakeAccounting;

    #[async_trait]
    impl AccountingSource for FakeAccounting {
        async fn day_batch(&self, _date: NaiveDate) -> Result<String> {
            Ok("1|COMPLETED|alice|lab|p|01:00:00|cpu=2,mem=8G,node=1|n1|8G||0:0|2|||cpu=2|t|t|\n"
                .to_string())
        }
        async fn watched_nodes(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_accounting_cycle_drains_backlog() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = AccountingEngine::new(collector_lib::AccountingConfig {
            state_dir: dir.path().to_path_buf(),
            account_prefix: "lab".to_string(),
            external_entity_prefix: "ext".to_string(),
            gpu_weights: HashMap::new(),
        });
        let accounting_loop = AccountingLoop {
            source: Arc::new(FakeAccounting),
            engine: engine.clone(),
            publisher: Arc::new(Publisher::new()),
            metrics: ExporterMetrics::new(),
            health: HealthRegistry::new(),
            interval: Duration::from_secs(86_400),
        };

        accounting_loop.cycle().await.unwrap();
        // Yesterday was merged and logged; a second cycle has no backlog.
        let today = chrono::Local::now().date_naive();
        assert!(engine.missing_dates(today).unwrap().is_empty());
        accounting_loop.cycle().await.unwrap();
    }
}
