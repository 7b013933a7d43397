//! Core library for the Slurm metrics exporter
//!
//! This crate turns the text output of Slurm command-line tools into
//! labeled numeric gauges:
//! - Record parsing (`scontrol -o` key=value lines, `sacct -p` rows)
//! - Overlapping node-state classification
//! - Hardware-generation classification and weighted capacity scores
//! - Cluster-wide and per-partition aggregation
//! - Daily accounting merge state
//!
//! The library is synchronous and transport-free: it consumes text batches
//! and produces [`snapshot::MetricFamily`] values. Command invocation and
//! metric exposition live in the exporter binary.

pub mod accounting;
pub mod cluster;
pub mod hardware;
pub mod hostlist;
pub mod partition;
pub mod record;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod tres;
pub mod units;

pub use accounting::{AccountingConfig, AccountingEngine};
pub use cluster::ClusterCollector;
pub use hardware::{GenerationTotals, WeightTable, WeightedCapacity};
pub use partition::PartitionCollector;
pub use record::RawRecord;
pub use snapshot::{MetricFamily, Snapshot};
pub use source::{AccountingSource, HostlistExpander, SchedulerSource};
pub use state::{Bucket, BucketSet, StateRules};
