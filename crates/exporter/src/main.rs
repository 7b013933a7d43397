//! Slurm exporter - cluster, partition and accounting metrics
//!
//! This binary polls the scheduler's command-line tools on two cadences
//! and serves the aggregated gauges over a Prometheus scrape endpoint.

use anyhow::Result;
use collector_lib::{
    AccountingConfig, AccountingEngine, ClusterCollector, PartitionCollector, StateRules,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod collect;
mod config;
mod health;
mod publish;
mod slurm;

use health::{components, HealthRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting slurm-exporter");

    let config = config::ExporterConfig::load()?;
    info!(
        api_port = config.api_port,
        snapshot_interval_secs = config.snapshot_interval_secs,
        accounting_enabled = config.accounting.enabled,
        "Exporter configured"
    );

    let health = HealthRegistry::new();
    health.register(components::SNAPSHOT).await;
    if config.accounting.enabled {
        health.register(components::ACCOUNTING).await;
    }

    let metrics = publish::ExporterMetrics::new();
    let publisher = Arc::new(publish::Publisher::new());
    let slurm = Arc::new(slurm::SlurmTool::new(
        Duration::from_secs(config.command_timeout_secs),
        config.accounting.sacct_lookback_days,
        config.accounting.watched_partition.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    let snapshot_loop = collect::SnapshotLoop {
        source: slurm.clone(),
        cluster: ClusterCollector::new(
            config.weights.clone(),
            StateRules {
                strip_transient_flags: config.strip_transient_flags,
            },
            config.node_filter.clone(),
        ),
        partition: PartitionCollector::new(config.weights.tres_to_gflops),
        publisher: publisher.clone(),
        metrics: metrics.clone(),
        health: health.clone(),
        interval: Duration::from_secs(config.snapshot_interval_secs),
    };
    tokio::spawn(snapshot_loop.run(shutdown_tx.subscribe()));

    if config.accounting.enabled {
        let accounting_loop = collect::AccountingLoop {
            source: slurm.clone(),
            engine: AccountingEngine::new(AccountingConfig {
                state_dir: config.accounting.state_dir.clone(),
                account_prefix: config.accounting.account_prefix.clone(),
                external_entity_prefix: config.accounting.external_entity_prefix.clone(),
                gpu_weights: config.weights.gpu.clone(),
            }),
            publisher: publisher.clone(),
            metrics: metrics.clone(),
            health: health.clone(),
            interval: Duration::from_secs(config.accounting_interval_secs),
        };
        tokio::spawn(accounting_loop.run(shutdown_tx.subscribe()));
    }

    let app_state = Arc::new(api::AppState::new(health.clone()));
    health.set_ready(true).await;
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        result = api_handle => {
            result??;
        }
    }
    let _ = shutdown_tx.send(());

    Ok(())
}
