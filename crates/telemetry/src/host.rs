use std::fs;
use std::sync::Mutex;
use steward_core::HostMetrics;

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Reads host CPU and memory usage from procfs. CPU usage is the share of
/// non-idle time since the previous call, so the first reading is 0.
#[derive(Default)]
pub struct HostProbe {
    previous: Mutex<Option<CpuTimes>>,
}

impl HostProbe {
    pub fn sample(&self) -> HostMetrics {
        let mut metrics = HostMetrics::default();

        if let Some(now) = fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| parse_cpu_times(&s))
        {
            let mut previous = self
                .previous
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(before) = *previous {
                metrics.cpu_percent = cpu_percent(before, now);
            }
            *previous = Some(now);
        }

        if let Some((total_kb, available_kb)) = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo(&s))
        {
            let used_kb = total_kb.saturating_sub(available_kb);
            metrics.memory_total_mb = total_kb / 1024;
            metrics.memory_used_mb = used_kb / 1024;
            if total_kb > 0 {
                metrics.memory_percent = (used_kb as f64 / total_kb as f64 * 100.0) as f32;
            }
        }

        metrics
    }
}

pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already folded into user/nice
    let total = fields.iter().take(8).sum();
    Some(CpuTimes { idle, total })
}

pub fn cpu_percent(before: CpuTimes, now: CpuTimes) -> f32 {
    let total = now.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = now.idle.saturating_sub(before.idle);
    ((total - idle.min(total)) as f64 / total as f64 * 100.0) as f32
}

/// `(MemTotal, MemAvailable)` in kB.
pub fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
            (Some("MemTotal:"), Some(v)) => total = Some(v),
            (Some("MemAvailable:"), Some(v)) => available = Some(v),
            _ => {}
        }
    }
    Some((total?, available?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_usage_is_a_delta() {
        let before = parse_cpu_times("cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 1 2 3 4").unwrap();
        let now = parse_cpu_times("cpu  200 0 200 900 0 0 0 0 0 0\n").unwrap();
        assert_eq!(before.total, 1000);
        let pct = cpu_percent(before, now);
        assert!((pct - 66.666).abs() < 0.1, "{}", pct);
        assert_eq!(cpu_percent(now, now), 0.0);
    }

    #[test]
    fn meminfo_uses_available_memory() {
        let info = "MemTotal:       32000000 kB\nMemFree:         1000000 kB\nMemAvailable:   16000000 kB\n";
        assert_eq!(parse_meminfo(info), Some((32_000_000, 16_000_000)));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }
}
