//! Planning and applying per-worker CPU affinity.
//!
//! Planning is pure: pool CPUs are concatenated in pool order and dealt into
//! contiguous slices, one per worker. Application happens after each child is
//! spawned and degrades gracefully: group-aware pinning where the platform
//! supports it, plain process affinity otherwise, then a fallback ladder for
//! masks the OS rejects. Affinity failures are never fatal; the first hard
//! failure flips a global flag so remaining spawns skip the attempt.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::unistd::Pid;

use crate::core::topology::{self, CpuPool};

// Monotonic false->true; checked before every spawn-time application.
static GLOBALLY_DISABLED: AtomicBool = AtomicBool::new(false);

/// True once affinity has been abandoned for the remainder of the job.
pub fn is_globally_disabled() -> bool {
    GLOBALLY_DISABLED.load(Ordering::Relaxed)
}

fn disable_globally() {
    if !GLOBALLY_DISABLED.swap(true, Ordering::Relaxed) {
        log::warn!("disabling CPU affinity for all remaining workers");
    }
}

/// Deal the flattened pool CPUs into `n` contiguous blocks. The first
/// `T mod n` blocks carry `ceil(T/n)` CPUs and the rest `floor(T/n)`; when a
/// block would be empty (more workers than CPUs) it receives the last CPU,
/// tolerating over-subscription.
pub fn plan_blocks(n: usize, pools: &[CpuPool]) -> Vec<Vec<u32>> {
    let flat = topology::flatten_pools(pools);
    if n == 0 || flat.is_empty() {
        return Vec::new();
    }

    let total = flat.len();
    let base = total / n;
    let extra = total % n;

    let mut blocks = Vec::with_capacity(n);
    let mut cursor = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        if len == 0 {
            blocks.push(vec![*flat.last().unwrap()]);
        } else {
            blocks.push(flat[cursor..cursor + len].to_vec());
            cursor += len;
        }
    }
    blocks
}

/// Pin `pid` to `planned`, falling back per the ladder described in the
/// module docs. Returns the CPU set actually applied, or `None` when affinity
/// was abandoned for this worker.
pub fn apply_to_process(pid: Pid, planned: &[u32]) -> Option<Vec<u32>> {
    if is_globally_disabled() || planned.is_empty() {
        return None;
    }

    // Preferred path on hosts that support it: move the child into the target
    // processor group, then apply the group-local mask.
    if let Ok((group, mask)) = topology::group_mask(planned) {
        match sys::set_group_affinity(pid, group, mask) {
            Ok(()) => {
                log::info!(
                    "applied group affinity to PID {pid}: group={group}, mask={mask:#x}"
                );
                return Some(planned.to_vec());
            }
            Err(sys::AffinityError::Unsupported) => {}
            Err(e) => {
                log::warn!("group affinity failed for PID {pid}: {e}");
            }
        }
    }

    match sys::set_process_affinity(pid, planned) {
        Ok(()) => return Some(planned.to_vec()),
        Err(sys::AffinityError::InvalidParameter) => {
            log_invalid_parameter_hints();
        }
        Err(e) => {
            log::warn!("setting affinity failed for PID {pid}: {e}");
            disable_globally();
            return None;
        }
    }

    // The OS rejected the planned mask (typically a block crossing processor
    // groups). Retry with the part of the block the parent may run on, or the
    // parent's whole allowed set if that intersection is empty.
    let allowed = sys::allowed_cpus();
    let mut fallback: Vec<u32> = planned
        .iter()
        .copied()
        .filter(|c| allowed.contains(c))
        .collect();
    if fallback.is_empty() {
        fallback = allowed;
    }
    if fallback.is_empty() {
        disable_globally();
        return None;
    }

    match sys::set_process_affinity(pid, &fallback) {
        Ok(()) => {
            log::warn!(
                "PID {pid}: planned affinity rejected; pinned to fallback set of {} CPUs",
                fallback.len()
            );
            Some(fallback)
        }
        Err(e) => {
            log::warn!("fallback affinity failed for PID {pid}: {e}");
            disable_globally();
            None
        }
    }
}

fn log_invalid_parameter_hints() {
    log::warn!("affinity diagnostic: the OS rejected the planned CPU list (invalid parameter)");
    log::warn!(
        "hint: this typically happens when CPU indices span multiple 64-CPU processor \
         groups; validate the NUMA map against this host or run with --disable_affinity \
         if the map is outdated"
    );
}

/// Narrow platform seam for the actual affinity syscalls. Non-Linux hosts get
/// stubs that report `Unsupported`, keeping the ladder above platform-agnostic.
mod sys {
    use nix::unistd::Pid;

    #[derive(Debug)]
    pub enum AffinityError {
        /// The mask was rejected outright (EINVAL / "the parameter is incorrect").
        InvalidParameter,
        /// The host has no such facility.
        Unsupported,
        Other(String),
    }

    impl std::fmt::Display for AffinityError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                AffinityError::InvalidParameter => write!(f, "invalid parameter"),
                AffinityError::Unsupported => write!(f, "unsupported on this platform"),
                AffinityError::Other(msg) => write!(f, "{msg}"),
            }
        }
    }

    /// Group-aware pinning (the `SetThreadGroupAffinity` path). No Linux
    /// equivalent is needed: a plain affinity mask already spans all CPUs.
    pub fn set_group_affinity(_pid: Pid, _group: u32, _mask: u64) -> Result<(), AffinityError> {
        Err(AffinityError::Unsupported)
    }

    #[cfg(target_os = "linux")]
    pub fn set_process_affinity(pid: Pid, cpus: &[u32]) -> Result<(), AffinityError> {
        let mut set = nix::sched::CpuSet::new();
        for &cpu in cpus {
            set.set(cpu as usize)
                .map_err(|_| AffinityError::InvalidParameter)?;
        }
        match nix::sched::sched_setaffinity(pid, &set) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EINVAL) => Err(AffinityError::InvalidParameter),
            Err(e) => Err(AffinityError::Other(e.to_string())),
        }
    }

    #[cfg(target_os = "linux")]
    pub fn allowed_cpus() -> Vec<u32> {
        let Ok(set) = nix::sched::sched_getaffinity(Pid::from_raw(0)) else {
            return Vec::new();
        };
        (0..nix::sched::CpuSet::count())
            .filter(|&i| set.is_set(i).unwrap_or(false))
            .map(|i| i as u32)
            .collect()
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_process_affinity(_pid: Pid, _cpus: &[u32]) -> Result<(), AffinityError> {
        Err(AffinityError::Unsupported)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn allowed_cpus() -> Vec<u32> {
        Vec::new()
    }
}
