//! Host and per-process resource usage from `/proc`.
//!
//! Replaces what the render farm's other tooling gets from psutil: total RAM
//! for the concurrency planner, per-child CPU% and RSS for heartbeats, and
//! descendant listings for stall diagnostics and recursive kills.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

/// Memory usage parsed from `/proc/meminfo`, in bytes.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct MemInfo {
    pub mem_total: Option<u64>,
    pub mem_free: Option<u64>,
}

/// Collect the fields we use from `/proc/meminfo`.
pub fn meminfo() -> std::io::Result<MemInfo> {
    let mut buffer = String::new();
    std::fs::File::open("/proc/meminfo")?.read_to_string(&mut buffer)?;
    Ok(parse_meminfo(&buffer))
}

fn parse_meminfo(buffer: &str) -> MemInfo {
    let mut mem = MemInfo::default();

    for line in buffer.lines() {
        let Some((name, val)) = line.split_once(':') else {
            // don't know how to parse this line
            continue;
        };
        let val = val.trim();
        let (val, unit) = val
            .rsplit_once(' ')
            .map(|(x, y)| (x, Some(y)))
            .unwrap_or((val, None));
        let Ok(val) = val.parse::<u64>() else {
            continue;
        };

        match name.trim() {
            "MemTotal" => mem.mem_total = as_bytes(val, unit),
            "MemFree" => mem.mem_free = as_bytes(val, unit),
            _ => {}
        }
    }

    mem
}

// Returns `None` if the unit is unknown or the value overflows.
fn as_bytes(val: u64, unit: Option<&str>) -> Option<u64> {
    let mul = match unit {
        None | Some("B") => 1,
        Some("kB") => 1024,
        Some(_) => return None,
    };
    val.checked_mul(mul)
}

/// Total host RAM in GiB, or `None` when `/proc/meminfo` is unreadable.
pub fn total_ram_gib() -> Option<f64> {
    let total = meminfo().ok()?.mem_total?;
    Some(total as f64 / (1024.0 * 1024.0 * 1024.0))
}

/// A single process's row from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    /// User + system time, in clock ticks.
    pub cpu_ticks: u64,
}

/// Read `/proc/<pid>/stat`. The comm field may itself contain spaces and
/// parentheses, so fields are split after the last `)`.
pub fn proc_stat(pid: i32) -> std::io::Result<ProcStat> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    parse_proc_stat(pid, &contents)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed stat"))
}

fn parse_proc_stat(pid: i32, contents: &str) -> Option<ProcStat> {
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    let comm = contents.get(open + 1..close)?.to_string();
    // fields after comm: state, ppid, ..., utime (field 14), stime (field 15)
    let rest: Vec<&str> = contents.get(close + 1..)?.split_whitespace().collect();
    let state = rest.first()?.chars().next()?;
    let ppid = rest.get(1)?.parse().ok()?;
    let utime: u64 = rest.get(11)?.parse().ok()?;
    let stime: u64 = rest.get(12)?.parse().ok()?;
    Some(ProcStat {
        pid,
        comm,
        state,
        ppid,
        cpu_ticks: utime + stime,
    })
}

/// Resident set size of `pid` in bytes, from `/proc/<pid>/statm`.
pub fn rss_bytes(pid: i32) -> std::io::Result<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/statm"))?;
    let pages: u64 = contents
        .split_whitespace()
        .nth(1)
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed statm"))?;
    Ok(pages * page_size())
}

fn page_size() -> u64 {
    // sysconf never fails for _SC_PAGESIZE on Linux
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as u64 } else { 4096 }
}

fn ticks_per_second() -> f64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 { hz as f64 } else { 100.0 }
}

/// Sample CPU usage of `pids` over `interval`, as a percentage of one CPU
/// (can exceed 100 for multi-threaded children). Pids that disappear during
/// the sample are omitted.
pub fn sample_cpu_percent(pids: &[i32], interval: Duration) -> HashMap<i32, f64> {
    let before: HashMap<i32, u64> = pids
        .iter()
        .filter_map(|&pid| proc_stat(pid).ok().map(|s| (pid, s.cpu_ticks)))
        .collect();

    std::thread::sleep(interval);

    let elapsed = interval.as_secs_f64().max(0.001);
    let hz = ticks_per_second();

    let mut usage = HashMap::with_capacity(before.len());
    for (&pid, &ticks0) in &before {
        if let Ok(after) = proc_stat(pid) {
            let delta = after.cpu_ticks.saturating_sub(ticks0) as f64;
            usage.insert(pid, delta / hz / elapsed * 100.0);
        }
    }
    usage
}

/// All live descendants of `pid`, children before grandchildren, found by
/// walking `/proc`'s ppid links.
pub fn descendants(pid: i32) -> Vec<i32> {
    let mut by_parent: HashMap<i32, Vec<i32>> = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(child) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        if let Ok(stat) = proc_stat(child) {
            by_parent.entry(stat.ppid).or_default().push(child);
        }
    }

    let mut result = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        if let Some(children) = by_parent.get(&parent) {
            for &child in children {
                result.push(child);
                frontier.push(child);
            }
        }
    }
    result
}

/// One line summarizing a process tree for stall diagnostics.
pub fn describe_process_tree(pid: i32) -> String {
    let mut parts = Vec::new();
    for p in std::iter::once(pid).chain(descendants(pid)) {
        match proc_stat(p) {
            Ok(stat) => {
                let rss_mib = rss_bytes(p).map(|b| b / (1024 * 1024)).unwrap_or(0);
                parts.push(format!("{p} ({}) state={} rss={rss_mib}MiB", stat.comm, stat.state));
            }
            Err(_) => parts.push(format!("{p} (gone)")),
        }
    }
    parts.join(", ")
}

/// True when `path` was last modified at least `age` ago. Unreadable
/// metadata counts as not yet quiet.
pub fn modified_at_least(path: &Path, age: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(elapsed) => elapsed >= age,
        // mtime in the future (clock skew): treat as quiet
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parses_kb_units() {
        let mem = parse_meminfo("MemTotal:       16384 kB\nMemFree:  1024 kB\nJunk\n");
        assert_eq!(mem.mem_total, Some(16384 * 1024));
        assert_eq!(mem.mem_free, Some(1024 * 1024));
    }

    #[test]
    fn meminfo_skips_unknown_units() {
        let mem = parse_meminfo("MemTotal: 5 floops\n");
        assert_eq!(mem.mem_total, None);
    }

    #[test]
    fn stat_comm_with_spaces_and_parens() {
        let line = "1234 (Web (Content)) S 1 1234 1234 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 4 0 100 0 0";
        let stat = parse_proc_stat(1234, line).unwrap();
        assert_eq!(stat.comm, "Web (Content)");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.cpu_ticks, 10);
    }

    #[test]
    fn stat_rejects_garbage() {
        assert!(parse_proc_stat(1, "not a stat line").is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn self_process_is_readable() {
        let pid = std::process::id() as i32;
        let stat = proc_stat(pid).unwrap();
        assert_eq!(stat.pid, pid);
        assert!(rss_bytes(pid).unwrap() > 0);
    }

    #[test]
    fn fresh_file_is_not_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        assert!(!modified_at_least(&path, Duration::from_secs(60)));
        assert!(modified_at_least(&path, Duration::ZERO));
    }
}
