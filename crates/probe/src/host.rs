//! Host resource snapshot: disk, memory, swap, CPU and load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Aggregate CPU jiffy counters from `/proc/stat`, kept between cycles so
/// the next snapshot can compute a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTotals {
    pub total: u64,
    pub idle: u64,
}

/// One cycle's host resource readings. Fields are `None` when the
/// underlying source is unavailable (non-Linux hosts, first cycle for CPU).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Mount point → used percent.
    pub disk_used_percent: BTreeMap<String, f64>,
    pub mem_used_percent: Option<f64>,
    pub swap_used_percent: Option<f64>,
    /// Delta-based CPU usage; `None` on the first cycle and after counter
    /// resets.
    pub cpu_used_percent: Option<f64>,
    pub load1: Option<f64>,
    pub load1_per_cpu: Option<f64>,
    pub cpu_totals: Option<CpuTotals>,
}

#[allow(clippy::cast_precision_loss)]
fn pct(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(used as f64 / total as f64 * 100.0)
}

/// Disk used% for one mount via statvfs.
#[must_use]
pub fn disk_used_percent(path: &Path) -> Option<f64> {
    let st = nix::sys::statvfs::statvfs(path).ok()?;
    let blocks = st.blocks();
    let avail = st.blocks_available();
    if blocks == 0 {
        return None;
    }
    pct(blocks.saturating_sub(avail), blocks)
}

fn parse_meminfo(text: &str) -> (Option<f64>, Option<f64>) {
    let mut fields: BTreeMap<&str, u64> = BTreeMap::new();
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
            fields.insert(key.trim(), kb);
        }
    }

    let mem = match (fields.get("MemTotal"), fields.get("MemAvailable")) {
        (Some(total), Some(avail)) => pct(total.saturating_sub(*avail), *total),
        _ => None,
    };
    let swap = match (fields.get("SwapTotal"), fields.get("SwapFree")) {
        (Some(total), Some(free)) if *total > 0 => pct(total.saturating_sub(*free), *total),
        _ => None,
    };
    (mem, swap)
}

fn parse_cpu_totals(stat_text: &str) -> Option<CpuTotals> {
    let line = stat_text.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 5 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTotals { total, idle })
}

/// CPU used% from the delta between two jiffy snapshots. `None` when there
/// is no previous snapshot or the counters did not advance (reboot,
/// wraparound).
#[must_use]
pub fn cpu_used_percent(prev: Option<CpuTotals>, cur: CpuTotals) -> Option<f64> {
    let prev = prev?;
    if cur.total <= prev.total {
        return None;
    }
    let d_total = cur.total - prev.total;
    let d_idle = cur.idle.saturating_sub(prev.idle).min(d_total);
    pct(d_total - d_idle, d_total)
}

fn parse_load1(loadavg_text: &str) -> Option<f64> {
    loadavg_text.split_whitespace().next()?.parse().ok()
}

/// Take one host snapshot. `prev_cpu` comes from the previous cycle's
/// snapshot (persisted in monitor state).
#[must_use]
pub fn snapshot_host(disk_paths: &[String], prev_cpu: Option<CpuTotals>) -> HostSnapshot {
    let mut disk = BTreeMap::new();
    for path in disk_paths {
        if let Some(used) = disk_used_percent(Path::new(path)) {
            disk.insert(path.clone(), used);
        }
    }

    let (mem_used_percent, swap_used_percent) = std::fs::read_to_string("/proc/meminfo")
        .map(|text| parse_meminfo(&text))
        .unwrap_or((None, None));

    let cpu_totals = std::fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|text| parse_cpu_totals(&text));
    let cpu_used = cpu_totals.and_then(|cur| cpu_used_percent(prev_cpu, cur));

    let load1 = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|text| parse_load1(&text));
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1);
    #[allow(clippy::cast_precision_loss)]
    let load1_per_cpu = load1.map(|l| l / cpus as f64);

    HostSnapshot {
        disk_used_percent: disk,
        mem_used_percent,
        swap_used_percent,
        cpu_used_percent: cpu_used,
        load1,
        load1_per_cpu,
        cpu_totals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_percentages() {
        let text = "MemTotal: 1000 kB\nMemAvailable: 250 kB\nSwapTotal: 400 kB\nSwapFree: 300 kB\n";
        let (mem, swap) = parse_meminfo(text);
        assert_eq!(mem, Some(75.0));
        assert_eq!(swap, Some(25.0));
    }

    #[test]
    fn meminfo_without_swap_is_none() {
        let text = "MemTotal: 1000 kB\nMemAvailable: 250 kB\nSwapTotal: 0 kB\nSwapFree: 0 kB\n";
        let (_, swap) = parse_meminfo(text);
        assert_eq!(swap, None);
    }

    #[test]
    fn cpu_totals_sum_all_columns() {
        let text = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 1 2 3 4 5\n";
        let totals = parse_cpu_totals(text).unwrap();
        assert_eq!(totals.total, 1000);
        assert_eq!(totals.idle, 850);
    }

    #[test]
    fn cpu_delta_basic() {
        let prev = CpuTotals { total: 1000, idle: 800 };
        let cur = CpuTotals { total: 2000, idle: 1500 };
        let used = cpu_used_percent(Some(prev), cur).unwrap();
        assert!((used - 30.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_delta_none_without_progress() {
        let prev = CpuTotals { total: 1000, idle: 800 };
        assert_eq!(cpu_used_percent(Some(prev), prev), None);
        let older = CpuTotals { total: 900, idle: 700 };
        assert_eq!(cpu_used_percent(Some(prev), older), None);
        assert_eq!(cpu_used_percent(None, prev), None);
    }

    #[test]
    fn load1_parses_first_field() {
        assert_eq!(parse_load1("0.42 0.36 0.30 1/234 5678"), Some(0.42));
        assert_eq!(parse_load1(""), None);
    }
}
