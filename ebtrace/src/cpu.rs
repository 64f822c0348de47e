//! CPU utility functions
//!
//! Utilities for querying CPU information from /sys filesystem.

use anyhow::{Context, Result};
use std::fs;

use crate::domain::CpuId;

const ONLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/online";

/// Get list of online CPU IDs from /sys/devices/system/cpu/online
///
/// Returns a vector of CPU IDs (e.g., [0, 1, 2, 3] for a 4-core system).
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub fn online_cpus() -> Result<Vec<CpuId>> {
    let content = fs::read_to_string(ONLINE_CPUS_PATH)
        .with_context(|| format!("Failed to read {ONLINE_CPUS_PATH}"))?;
    parse_cpu_list(&content)
}

/// Parse a kernel cpu list like `"0-3"` or `"0-3,8-11"` (NUMA systems).
///
/// # Errors
/// Returns an error on a malformed entry
pub fn parse_cpu_list(list: &str) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();

    for range in list.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            let start: u32 = start.parse().with_context(|| format!("Bad cpu range {range}"))?;
            let end: u32 = end.parse().with_context(|| format!("Bad cpu range {range}"))?;
            cpus.extend((start..=end).map(CpuId));
        } else {
            let cpu: u32 = range.parse().with_context(|| format!("Bad cpu id {range}"))?;
            cpus.push(CpuId(cpu));
        }
    }

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3\n").unwrap(), (0..4).map(CpuId).collect::<Vec<_>>());
        assert_eq!(
            parse_cpu_list("0-1,4,8-9").unwrap(),
            vec![CpuId(0), CpuId(1), CpuId(4), CpuId(8), CpuId(9)]
        );
        assert!(parse_cpu_list("0-x").is_err());
        assert!(parse_cpu_list("").unwrap().is_empty());
    }

    #[test]
    fn test_online_cpus() {
        // This test relies on /sys being available (Linux only)
        let cpus = online_cpus().expect("Failed to read online CPUs");
        assert!(!cpus.is_empty(), "Should have at least one CPU");

        // CPU 0 should always exist
        assert!(cpus.contains(&CpuId(0)));
        assert!(cpus.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
