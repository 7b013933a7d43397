//! Seams to the external scheduler tooling
//!
//! The engines never invoke commands themselves; they consume text batches
//! fetched through these traits. The exporter binary implements them over
//! `scontrol`/`sacct` with hard timeouts, tests substitute canned dumps.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;

/// Live snapshot inputs: the `scontrol -o` dumps.
#[async_trait]
pub trait SchedulerSource: Send + Sync {
    /// `scontrol -o show node`, one node record per line.
    async fn show_nodes(&self) -> Result<String>;
    /// `scontrol -o show partition`, one partition record per line.
    async fn show_partitions(&self) -> Result<String>;
    /// `scontrol -od show job`, one job record per line with per-node
    /// resource segments.
    async fn show_jobs(&self) -> Result<String>;
    /// `scontrol show hostnames <expr>` for expressions the built-in
    /// bracket expansion cannot handle.
    async fn expand_hostnames(&self, expr: &str) -> Result<Vec<String>>;
}

/// Daily accounting inputs.
#[async_trait]
pub trait AccountingSource: Send + Sync {
    /// The pipe-delimited `sacct` batch whose jobs ended on `date`.
    async fn day_batch(&self, date: NaiveDate) -> Result<String>;
    /// The node names of the watched partition, used for catch-all
    /// reclassification.
    async fn watched_nodes(&self) -> Result<Vec<String>>;
}

/// Synchronous hostlist expansion used inside an aggregation pass.
pub trait HostlistExpander {
    fn expand(&self, expr: &str) -> Result<Vec<String>>;
}

/// Pure bracket-expression expansion, the default expander.
#[derive(Debug, Clone, Copy, Default)]
pub struct BracketExpander;

impl HostlistExpander for BracketExpander {
    fn expand(&self, expr: &str) -> Result<Vec<String>> {
        Ok(crate::hostlist::expand(expr)?)
    }
}

/// Bracket expansion backed by a cache of pre-resolved expressions.
///
/// The exporter resolves the expressions bracket expansion rejects through
/// [`SchedulerSource::expand_hostnames`] before the (synchronous)
/// aggregation pass and hands the results over here.
#[derive(Debug, Clone, Default)]
pub struct CachedExpander {
    resolved: HashMap<String, Vec<String>>,
}

impl CachedExpander {
    pub fn new(resolved: HashMap<String, Vec<String>>) -> Self {
        Self { resolved }
    }
}

impl HostlistExpander for CachedExpander {
    fn expand(&self, expr: &str) -> Result<Vec<String>> {
        if let Some(hosts) = self.resolved.get(expr) {
            return Ok(hosts.clone());
        }
        Ok(crate::hostlist::expand(expr)?)
    }
}
