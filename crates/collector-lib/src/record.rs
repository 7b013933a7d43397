//! Parsing of `scontrol -o` record lines
//!
//! Each line is a sequence of whitespace-separated `Key=Value` tokens.
//! Values may contain embedded spaces (protected by double quotes) and
//! designated composite fields (`CfgTRES`, `AllocTRES`, `TRES`,
//! `TRESBillingWeights`) carry nested comma-separated `subkey=subvalue`
//! lists that are exploded into secondary maps.
//!
//! Accessors never fail past this boundary: a missing key yields a typed
//! default and `N/A` numeric fields read as "unknown".

use std::collections::HashMap;

/// Split a record line into shell words.
///
/// Whitespace separates tokens and double quotes group embedded spaces.
/// Single quotes are kept literally; the upstream dumps escape them before
/// they reach us.
pub fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// One parsed record line: a mapping from field name to raw value string.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    fields: HashMap<String, String>,
}

impl RawRecord {
    /// Parse one record line. Tokens without `=` are ignored; a duplicated
    /// key keeps the last occurrence.
    pub fn parse(line: &str) -> Self {
        let mut fields = HashMap::new();
        for word in shell_words(line) {
            if let Some((key, value)) = word.split_once('=') {
                fields.insert(key.to_string(), value.to_string());
            }
        }
        Self { fields }
    }

    /// True if the line carried no `Key=Value` tokens at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Integer field; absent, `N/A` or unparsable reads as `default`.
    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(v) => v.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Float field that may legitimately be unavailable. `None` means the
    /// value contributes nothing to a sum but the record still counts.
    pub fn f64_opt(&self, key: &str) -> Option<f64> {
        let v = self.get(key)?;
        if v == "N/A" {
            return None;
        }
        v.parse().ok()
    }

    /// Explode a composite field into a resource -> quantity-string map.
    /// An absent field yields an empty map.
    pub fn subrecord(&self, key: &str) -> HashMap<String, String> {
        let mut sub = HashMap::new();
        if let Some(value) = self.get(key) {
            for item in value.split(',') {
                if let Some((k, v)) = item.split_once('=') {
                    sub.insert(k.to_string(), v.to_string());
                }
            }
        }
        sub
    }

    /// Comma-separated list field; absent yields an empty list.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(v) if !v.is_empty() => v.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }
}

/// Per-node resource groups from `scontrol -od show job` output.
///
/// A job line repeats ` Nodes=<expr> CPU_IDs=... Mem=... GRES=...` groups
/// separated by runs of spaces; the leading `NumNodes=` group is not one of
/// them.
pub fn job_node_segments(line: &str) -> Vec<RawRecord> {
    line.split("  ")
        .filter(|seg| seg.contains("Nodes=") && !seg.contains("NumNodes="))
        .map(RawRecord::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_words_plain() {
        let words = shell_words("NodeName=holy7c01 CPUTot=64 State=MIXED");
        assert_eq!(words, vec!["NodeName=holy7c01", "CPUTot=64", "State=MIXED"]);
    }

    #[test]
    fn test_shell_words_quoted_value() {
        let words = shell_words(r#"Comment="two words" CPUTot=4"#);
        assert_eq!(words, vec!["Comment=two words", "CPUTot=4"]);
    }

    #[test]
    fn test_parse_basic_fields() {
        let rec = RawRecord::parse("NodeName=n1 CPUTot=64 CPUAlloc=32 RealMemory=256000");
        assert_eq!(rec.get("NodeName"), Some("n1"));
        assert_eq!(rec.u64_or("CPUTot", 0), 64);
        assert_eq!(rec.u64_or("Missing", 7), 7);
    }

    #[test]
    fn test_tokens_without_equals_ignored() {
        let rec = RawRecord::parse("garbage NodeName=n1 also-garbage");
        assert_eq!(rec.get("NodeName"), Some("n1"));
        assert!(!rec.has("garbage"));
    }

    #[test]
    fn test_duplicate_key_last_wins() {
        let rec = RawRecord::parse("State=IDLE State=DOWN");
        assert_eq!(rec.get("State"), Some("DOWN"));
    }

    #[test]
    fn test_na_reads_as_unknown() {
        let rec = RawRecord::parse("CPULoad=N/A FreeMem=1024");
        assert_eq!(rec.f64_opt("CPULoad"), None);
        assert_eq!(rec.f64_opt("FreeMem"), Some(1024.0));
    }

    #[test]
    fn test_subrecord_explosion() {
        let rec = RawRecord::parse("CfgTRES=cpu=64,mem=256000M,gres/gpu=4");
        let tres = rec.subrecord("CfgTRES");
        assert_eq!(tres.get("cpu").map(String::as_str), Some("64"));
        assert_eq!(tres.get("gres/gpu").map(String::as_str), Some("4"));
    }

    #[test]
    fn test_subrecord_absent_is_empty() {
        let rec = RawRecord::parse("NodeName=n1");
        assert!(rec.subrecord("AllocTRES").is_empty());
    }

    #[test]
    fn test_job_node_segments() {
        let line = "JobId=123 JobState=RUNNING NumNodes=2  \
                    Nodes=n1 CPU_IDs=0-15 Mem=64000 GRES=gpu:h100:2(IDX:0-1)  \
                    Nodes=n2 CPU_IDs=0-3 Mem=16000 GRES=";
        let segments = job_node_segments(line);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].get("Nodes"), Some("n1"));
        assert_eq!(segments[0].get("CPU_IDs"), Some("0-15"));
        assert_eq!(segments[1].get("Nodes"), Some("n2"));
    }
}
