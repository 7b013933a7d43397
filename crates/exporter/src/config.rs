//! Exporter configuration
//!
//! Layered from an optional YAML/TOML file (the site weight tables live
//! there) and `SLURM_EXPORTER_*` environment variables. Every field has a
//! serde default so a bare environment still yields a runnable exporter.

use anyhow::{Context, Result};
use collector_lib::WeightTable;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Port for the /metrics, /healthz and /readyz endpoints.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Live snapshot collection interval in seconds.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// Accounting merge interval in seconds (daily cadence).
    #[serde(default = "default_accounting_interval")]
    pub accounting_interval_secs: u64,

    /// Hard timeout for one external command invocation in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// When set, only nodes whose name contains this substring count
    /// toward the cluster aggregates.
    #[serde(default)]
    pub node_filter: Option<String>,

    /// Strip transient state qualifiers (+CLOUD and friends) before
    /// classifying node states.
    #[serde(default = "default_true")]
    pub strip_transient_flags: bool,

    /// Site hardware-generation weight tables and the TRES-to-GFLOPs
    /// scalar.
    #[serde(default)]
    pub weights: WeightTable,

    #[serde(default)]
    pub accounting: AccountingSettings,
}

/// Accounting merge settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory for the processed-dates log and the hour tables.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Namespace prefix selecting tracked accounts and "our" partitions.
    #[serde(default = "default_account_prefix")]
    pub account_prefix: String,

    /// Prefix for the synthetic catch-all partition entities.
    #[serde(default = "default_external_entity_prefix")]
    pub external_entity_prefix: String,

    /// Partition whose nodes define "watched hardware" for the catch-all
    /// reclassification.
    #[serde(default = "default_watched_partition")]
    pub watched_partition: String,

    /// How many days before the batch date the sacct query window starts;
    /// long jobs that started earlier but ended on the batch date still
    /// appear.
    #[serde(default = "default_lookback_days")]
    pub sacct_lookback_days: i64,
}

impl Default for AccountingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: default_state_dir(),
            account_prefix: default_account_prefix(),
            external_entity_prefix: default_external_entity_prefix(),
            watched_partition: default_watched_partition(),
            sacct_lookback_days: default_lookback_days(),
        }
    }
}

fn default_api_port() -> u16 {
    9008
}

fn default_snapshot_interval() -> u64 {
    55
}

fn default_accounting_interval() -> u64 {
    86_400
}

fn default_command_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/slurm-exporter")
}

fn default_account_prefix() -> String {
    "kempner".to_string()
}

fn default_external_entity_prefix() -> String {
    "fasrc".to_string()
}

fn default_watched_partition() -> String {
    "kempner_dev".to_string()
}

fn default_lookback_days() -> i64 {
    10
}

impl ExporterConfig {
    /// Load configuration from the optional config file and environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var("SLURM_EXPORTER_CONFIG")
            .unwrap_or_else(|_| "/etc/slurm-exporter/config".to_string());
        let config = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(config::Environment::with_prefix("SLURM_EXPORTER").separator("__"))
            .build()
            .context("building configuration")?;
        config
            .try_deserialize()
            .context("deserializing configuration")
    }
}
