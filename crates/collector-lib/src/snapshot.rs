//! Snapshot value model
//!
//! The aggregation engines produce plain (metric name, label set) -> value
//! mappings; the exporter binary owns their Prometheus representation. This
//! keeps the engines transport-free and testable against literal numbers.

/// One labeled gauge family refreshed per collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
    pub samples: Vec<Sample>,
}

/// One labeled value within a family.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub label_values: Vec<String>,
    pub value: f64,
}

impl MetricFamily {
    pub fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            samples: Vec::new(),
        }
    }

    pub fn push(&mut self, label_values: Vec<String>, value: f64) {
        debug_assert_eq!(label_values.len(), self.label_names.len());
        self.samples.push(Sample {
            label_values,
            value,
        });
    }

    /// Convenience for the common single-`field`-label families.
    pub fn push_field(&mut self, field: &str, value: f64) {
        self.push(vec![field.to_string()], value);
    }

    /// Look a sample up by its label values (test helper, linear scan).
    pub fn value(&self, label_values: &[&str]) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.label_values.iter().map(String::as_str).eq(label_values.iter().copied()))
            .map(|s| s.value)
    }
}

/// All families produced by one collection cycle.
pub type Snapshot = Vec<MetricFamily>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_lookup() {
        let mut family = MetricFamily::new("lsload", "Aggregate node stats", &["field"]);
        family.push_field("cputot", 1024.0);
        family.push_field("cpualloc", 512.0);
        assert_eq!(family.value(&["cputot"]), Some(1024.0));
        assert_eq!(family.value(&["nope"]), None);
    }
}
