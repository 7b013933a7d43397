//! Memory quantity normalization
//!
//! Slurm reports memory either as a bare number (already in a known unit)
//! or with an `M`/`G` suffix. All suffix handling lives here so callers
//! state their target unit explicitly instead of scattering `strip('G')`
//! and `/1024` conversions inline.

/// Target unit for a normalized memory quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemUnit {
    Megabytes,
    Gigabytes,
}

/// Parse a memory quantity string into `target` units.
///
/// A trailing `M` or `G` names the unit of the raw value; without a suffix
/// the value is taken to already be in the target unit (no silent scaling).
/// Returns `None` for an empty or non-numeric value.
pub fn parse_mem(raw: &str, target: MemUnit) -> Option<f64> {
    let trimmed = raw.trim();
    let (digits, unit) = match trimmed.strip_suffix(['G', 'g']) {
        Some(d) => (d, Some(MemUnit::Gigabytes)),
        None => match trimmed.strip_suffix(['M', 'm']) {
            Some(d) => (d, Some(MemUnit::Megabytes)),
            None => (trimmed, None),
        },
    };
    let value: f64 = digits.parse().ok()?;
    let mb = match unit {
        Some(MemUnit::Gigabytes) => value * 1024.0,
        Some(MemUnit::Megabytes) => value,
        None => return Some(value),
    };
    Some(match target {
        MemUnit::Megabytes => mb,
        MemUnit::Gigabytes => mb / 1024.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gigabyte_suffix_to_gb() {
        assert_eq!(parse_mem("32G", MemUnit::Gigabytes), Some(32.0));
    }

    #[test]
    fn test_megabyte_suffix_to_gb() {
        assert_eq!(parse_mem("32768M", MemUnit::Gigabytes), Some(32.0));
    }

    #[test]
    fn test_gigabyte_suffix_to_mb() {
        assert_eq!(parse_mem("2G", MemUnit::Megabytes), Some(2048.0));
    }

    #[test]
    fn test_no_suffix_is_target_unit() {
        // No suffix means "already in the target unit" -- never scaled.
        assert_eq!(parse_mem("500", MemUnit::Gigabytes), Some(500.0));
        assert_eq!(parse_mem("500", MemUnit::Megabytes), Some(500.0));
    }

    #[test]
    fn test_garbage_is_none() {
        assert_eq!(parse_mem("", MemUnit::Gigabytes), None);
        assert_eq!(parse_mem("N/A", MemUnit::Gigabytes), None);
    }
}
