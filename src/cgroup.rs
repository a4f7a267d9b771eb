//! Container-aware CPU and memory limits.
//!
//! Worker counts and the raw-row buffer capacity are derived from the
//! resources actually granted to the process, which inside a container are
//! the cgroup quotas rather than the host totals.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();
static ALLOWED_MEMORY: OnceLock<u64> = OnceLock::new();

/// Memory assumed available when neither cgroup limits nor /proc/meminfo
/// can be read.
const FALLBACK_MEMORY_BYTES: u64 = 1 << 30;

/// Returns the number of CPU cores available to the process, honoring
/// cgroup CPU quotas when running in a container.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(detect_cpu_quota)
}

/// Returns the number of bytes of memory the process may reasonably use:
/// the cgroup memory limit when one is set, otherwise 60% of the physical
/// memory reported by /proc/meminfo.
pub fn allowed_memory() -> u64 {
    *ALLOWED_MEMORY.get_or_init(detect_allowed_memory)
}

fn detect_cpu_quota() -> usize {
    if let Some(n) = parse_cpu_override_env("TSLAB_MAX_CPUS") {
        return n;
    }

    if let Some(quota) = get_cpu_quota() {
        let num_cpus = num_cpus::get();
        // Respect fractional quotas below 1 CPU by reserving one worker.
        let calculated = quota.ceil() as usize;
        if calculated > 0 && calculated < num_cpus {
            return calculated;
        }
    }

    num_cpus::get()
}

fn parse_cpu_override_env(var_name: &str) -> Option<usize> {
    let value = std::env::var(var_name).ok()?;
    let parsed = value.parse::<usize>().ok()?;
    (parsed > 0).then_some(parsed)
}

fn detect_allowed_memory() -> u64 {
    if let Some(limit) = get_memory_limit()
        && limit > 0
    {
        return limit as u64;
    }
    match read_mem_total_bytes() {
        Some(total) => total / 10 * 6,
        None => FALLBACK_MEMORY_BYTES,
    }
}

/// Gets the CPU quota from cgroup v2, falling back to v1.
fn get_cpu_quota() -> Option<f64> {
    get_cpu_quota_v2().or_else(get_cpu_quota_v1)
}

fn get_cpu_quota_v2() -> Option<f64> {
    let cpu_max_path = "/sys/fs/cgroup/cpu.max";
    if !Path::new(cpu_max_path).exists() {
        return None;
    }

    let content = fs::read_to_string(cpu_max_path).ok()?;
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() != 2 || parts[0] == "max" {
        return None;
    }

    let quota = parts[0].parse::<f64>().ok()?;
    let period = parts[1].parse::<f64>().ok()?;
    if period <= 0.0 {
        return None;
    }
    Some(quota / period)
}

fn get_cpu_quota_v1() -> Option<f64> {
    let quota = read_cgroup_value("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    if quota <= 0 {
        // Quota not set, check online CPU count instead.
        return get_online_cpu_count();
    }

    let period = read_cgroup_value("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;
    if period <= 0 {
        return None;
    }
    Some(quota as f64 / period as f64)
}

fn read_cgroup_value(path: &str) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn get_online_cpu_count() -> Option<f64> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online").ok()?;
    Some(count_cpu_ranges(&content) as f64)
}

/// Counts CPUs from a range string like "0-3,5,7-9".
fn count_cpu_ranges(data: &str) -> usize {
    let data = data.trim();
    let mut count = 0;

    for part in data.split(',') {
        if part.contains('-') {
            let bounds: Vec<&str> = part.split('-').collect();
            if bounds.len() == 2
                && let (Ok(start), Ok(end)) =
                    (bounds[0].parse::<usize>(), bounds[1].parse::<usize>())
                && end >= start
            {
                count += end - start + 1;
            }
        } else if part.parse::<usize>().is_ok() {
            count += 1;
        }
    }

    count
}

/// Returns the cgroup memory limit in bytes, v2 first, then v1.
fn get_memory_limit() -> Option<i64> {
    get_memory_limit_v2().or_else(get_memory_limit_v1)
}

fn get_memory_limit_v2() -> Option<i64> {
    let mem_max_path = "/sys/fs/cgroup/memory.max";
    if !Path::new(mem_max_path).exists() {
        return None;
    }

    let content = fs::read_to_string(mem_max_path).ok()?;
    let trimmed = content.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse().ok()
}

fn get_memory_limit_v1() -> Option<i64> {
    // v1 reports a huge sentinel when no limit is configured.
    let limit = read_cgroup_value("/sys/fs/cgroup/memory/memory.limit_in_bytes")?;
    (limit > 0 && limit < (1 << 50)).then_some(limit)
}

fn read_mem_total_bytes() -> Option<u64> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_cpu_ranges() {
        assert_eq!(count_cpu_ranges("0-3"), 4);
        assert_eq!(count_cpu_ranges("0-3,5"), 5);
        assert_eq!(count_cpu_ranges("0-3,5,7-9"), 8);
        assert_eq!(count_cpu_ranges("0"), 1);
        assert_eq!(count_cpu_ranges(""), 0);
        assert_eq!(count_cpu_ranges("3-1"), 0);
    }

    #[test]
    fn test_available_cpus() {
        let cpus = available_cpus();
        assert!(cpus > 0);
        assert!(cpus <= 1024);
    }

    #[test]
    fn test_allowed_memory_is_positive() {
        assert!(allowed_memory() > 0);
    }
}
