//! Logical and physical CPU counts from sysfs.
//!
//! Counts respect the current CPU affinity and cgroups via
//! `sched_getaffinity`, so a container sees its own share of the host. All
//! probes return `None` rather than failing the job when sysfs is missing or
//! malformed; callers fall back to conservative constants.

use std::collections::HashSet;

/// Parse a sysfs range list like `0-5,7,13-19` into CPU ids. Malformed pieces
/// are skipped. Items are returned in list order and may repeat.
pub fn parse_range_list(list: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for piece in list.split(',') {
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('-') {
            Some((start, end)) => {
                let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) else {
                    continue;
                };
                cpus.extend(start..=end);
            }
            None => {
                if let Ok(cpu) = piece.parse::<u32>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Online CPUs from `/sys/devices/system/cpu/online`.
pub fn online_cpus() -> Option<Vec<u32>> {
    let text = std::fs::read_to_string("/sys/devices/system/cpu/online").ok()?;
    let cpus = parse_range_list(text.trim());
    (!cpus.is_empty()).then_some(cpus)
}

/// The physical core id of a CPU from
/// `/sys/devices/system/cpu/cpu{cpu}/topology/core_id`.
fn core_id(cpu: u32) -> Option<u32> {
    let name = format!("/sys/devices/system/cpu/cpu{cpu}/topology/core_id");
    std::fs::read_to_string(name).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn allowed(cpu: u32) -> bool {
    static AFFINITY: once_cell::sync::Lazy<Option<nix::sched::CpuSet>> =
        once_cell::sync::Lazy::new(|| {
            nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)).ok()
        });
    match *AFFINITY {
        Some(set) => set.is_set(cpu as usize).unwrap_or(false),
        None => true,
    }
}

#[cfg(not(target_os = "linux"))]
fn allowed(_cpu: u32) -> bool {
    true
}

/// Count the logical CPUs this process may run on.
pub fn logical_cpu_count() -> Option<u32> {
    let count = online_cpus()?.into_iter().filter(|&c| allowed(c)).count();
    u32::try_from(count).ok().filter(|&c| c > 0)
}

/// Count distinct physical cores among the CPUs this process may run on.
pub fn physical_cpu_count() -> Option<u32> {
    let mut cores = HashSet::new();
    for cpu in online_cpus()? {
        if allowed(cpu) {
            cores.insert(core_id(cpu)?);
        }
    }
    u32::try_from(cores.len()).ok().filter(|&c| c > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(list: &str, array: &[u32]) {
        assert_eq!(parse_range_list(list), array);
    }

    #[test]
    fn range_list_forms() {
        check("", &[]);
        check("1", &[1]);
        check("1,2", &[1, 2]);
        check("1-2", &[1, 2]);
        check("1-1", &[1]);
        check("1,2-4,5", &[1, 2, 3, 4, 5]);
        check(
            "0-5,7-9,13,15-19",
            &[0, 1, 2, 3, 4, 5, 7, 8, 9, 13, 15, 16, 17, 18, 19],
        );
        check("1,,5", &[1, 5]);
        check("1,1,5", &[1, 1, 5]);
        check("1-0", &[]);
    }

    #[test]
    fn malformed_pieces_skipped() {
        check("1,x,3", &[1, 3]);
        check("a-b,4", &[4]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn counts_are_consistent_on_linux() {
        let logical = logical_cpu_count().unwrap();
        assert!(logical >= 1);
        if let Some(physical) = physical_cpu_count() {
            assert!(physical >= 1);
            assert!(physical <= logical);
        }
    }
}
