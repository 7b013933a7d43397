//! Typed extraction from TRES resource-list maps
//!
//! A TRES sub-record maps resource names (`cpu`, `mem`, `node`,
//! `gres/gpu`, `gres/gpu:<model>`) to quantity strings. This module pulls
//! typed quantities out of one, with absence defaults and the two GPU
//! shapes seen operationally: a plain count and a typed count whose model
//! substring feeds the weight-table lookup.

use crate::record::RawRecord;
use crate::units::{parse_mem, MemUnit};
use std::collections::HashMap;

/// A parsed TRES resource list.
#[derive(Debug, Clone, Default)]
pub struct TresMap {
    entries: HashMap<String, String>,
}

impl TresMap {
    /// Explode the named composite field of a record; an absent field
    /// yields an empty map (normal for nodes with nothing allocated).
    pub fn from_field(record: &RawRecord, key: &str) -> Self {
        Self {
            entries: record.subrecord(key),
        }
    }

    /// Parse a raw TRES string such as `cpu=4,mem=16G,gres/gpu:h100=2`.
    pub fn from_str(raw: &str) -> Self {
        let mut entries = HashMap::new();
        for item in raw.split(',') {
            if let Some((k, v)) = item.split_once('=') {
                entries.insert(k.to_string(), v.to_string());
            }
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.entries
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn cpus(&self) -> u64 {
        self.u64_or("cpu", 0)
    }

    pub fn nodes(&self) -> u64 {
        self.u64_or("node", 0)
    }

    /// Memory normalized to `target`; 0 when absent or unparsable.
    pub fn mem(&self, target: MemUnit) -> f64 {
        self.entries
            .get("mem")
            .and_then(|v| parse_mem(v, target))
            .unwrap_or(0.0)
    }

    /// Plain GPU count (`gres/gpu=<n>`); 0 when the node has no GPUs.
    pub fn gpus(&self) -> u64 {
        self.u64_or("gres/gpu", 0)
    }

    /// Typed GPU entry (`gres/gpu:<model>=<n>`), if any.
    pub fn gpu_model(&self) -> Option<(String, u64)> {
        for (key, value) in &self.entries {
            if let Some(model) = key.strip_prefix("gres/gpu:") {
                let count = value.parse().unwrap_or(0);
                return Some((model.to_ascii_lowercase(), count));
            }
        }
        None
    }

    /// Weight factor for the typed GPU model, looked up by substring match
    /// against the table keys. The longest matching key wins so `a100-mig`
    /// is never shadowed by `a100`. 0.0 when no typed entry matches.
    pub fn gpu_weight(&self, table: &HashMap<String, f64>) -> f64 {
        self.matched_gpu_generation(table)
            .and_then(|name| table.get(&name).copied())
            .unwrap_or(0.0)
    }

    /// The weight-table key matched by the typed GPU model, if any.
    pub fn matched_gpu_generation(&self, table: &HashMap<String, f64>) -> Option<String> {
        let (model, _) = self.gpu_model()?;
        table
            .keys()
            .filter(|name| model.contains(name.as_str()))
            .max_by_key(|name| name.len())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_table() -> HashMap<String, f64> {
        HashMap::from([
            ("a100".to_string(), 209.1),
            ("a100-mig".to_string(), 29.9),
            ("h100".to_string(), 546.9),
        ])
    }

    #[test]
    fn test_plain_counts() {
        let tres = TresMap::from_str("cpu=64,mem=256000M,node=1,gres/gpu=4");
        assert_eq!(tres.cpus(), 64);
        assert_eq!(tres.nodes(), 1);
        assert_eq!(tres.gpus(), 4);
        assert_eq!(tres.mem(MemUnit::Gigabytes), 250.0);
    }

    #[test]
    fn test_gpu_absent_defaults_to_zero() {
        let tres = TresMap::from_str("cpu=32,mem=128G");
        assert_eq!(tres.gpus(), 0);
        assert_eq!(tres.gpu_model(), None);
    }

    #[test]
    fn test_typed_gpu_model_and_weight() {
        let tres = TresMap::from_str("cpu=24,mem=100G,gres/gpu:h100=2");
        assert_eq!(tres.gpu_model(), Some(("h100".to_string(), 2)));
        let weight = tres.gpu_weight(&gpu_table());
        assert_eq!(weight, 546.9);
        // 2 x 546.9 is the weighted GPU contribution for this job.
        assert_eq!(2.0 * weight, 1093.8);
    }

    #[test]
    fn test_longest_model_match_wins() {
        let tres = TresMap::from_str("gres/gpu:a100-mig=1");
        assert_eq!(
            tres.matched_gpu_generation(&gpu_table()),
            Some("a100-mig".to_string())
        );
        assert_eq!(tres.gpu_weight(&gpu_table()), 29.9);
    }

    #[test]
    fn test_from_field() {
        let rec = RawRecord::parse("NodeName=n1 AllocTRES=cpu=8,mem=32G");
        let tres = TresMap::from_field(&rec, "AllocTRES");
        assert_eq!(tres.cpus(), 8);
        let empty = TresMap::from_field(&rec, "CfgTRES");
        assert!(empty.is_empty());
    }
}
