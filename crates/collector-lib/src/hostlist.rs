//! Compact Slurm hostlist expansion
//!
//! Expands expressions such as `holy7c[01-04,09],gpu[1-2]b` into individual
//! host names, preserving zero padding. This covers the common compact
//! forms emitted in `NodeList`/`Nodes` fields; anything it cannot parse is
//! reported as an error so the caller can fall back to an external
//! expander or drop the contribution.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HostlistError {
    #[error("unbalanced brackets in hostlist expression: {0}")]
    UnbalancedBrackets(String),
    #[error("bad numeric range {0:?} in hostlist expression")]
    BadRange(String),
}

/// Expand a compact hostlist expression into individual host names.
pub fn expand(expr: &str) -> Result<Vec<String>, HostlistError> {
    let mut hosts = Vec::new();
    for part in split_top_level(expr)? {
        if part.is_empty() {
            continue;
        }
        match part.find('[') {
            None => hosts.push(part.to_string()),
            Some(open) => {
                let close = part
                    .rfind(']')
                    .filter(|c| *c > open)
                    .ok_or_else(|| HostlistError::UnbalancedBrackets(expr.to_string()))?;
                let prefix = &part[..open];
                let body = &part[open + 1..close];
                let suffix = &part[close + 1..];
                if suffix.contains('[') {
                    // Multiple bracket groups per element are not emitted by
                    // the dumps we consume.
                    return Err(HostlistError::UnbalancedBrackets(expr.to_string()));
                }
                for element in body.split(',') {
                    expand_range(prefix, element, suffix, &mut hosts)?;
                }
            }
        }
    }
    Ok(hosts)
}

/// Split on commas that are not inside a bracket group.
fn split_top_level(expr: &str) -> Result<Vec<&str>, HostlistError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostlistError::UnbalancedBrackets(expr.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(HostlistError::UnbalancedBrackets(expr.to_string()));
    }
    parts.push(&expr[start..]);
    Ok(parts)
}

fn expand_range(
    prefix: &str,
    element: &str,
    suffix: &str,
    out: &mut Vec<String>,
) -> Result<(), HostlistError> {
    match element.split_once('-') {
        None => {
            if element.is_empty() || !element.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HostlistError::BadRange(element.to_string()));
            }
            out.push(format!("{prefix}{element}{suffix}"));
        }
        Some((lo, hi)) => {
            let width = lo.len();
            let lo: u64 = lo
                .parse()
                .map_err(|_| HostlistError::BadRange(element.to_string()))?;
            let hi: u64 = hi
                .parse()
                .map_err(|_| HostlistError::BadRange(element.to_string()))?;
            if hi < lo {
                return Err(HostlistError::BadRange(element.to_string()));
            }
            for n in lo..=hi {
                out.push(format!("{prefix}{n:0width$}{suffix}"));
            }
        }
    }
    Ok(())
}
