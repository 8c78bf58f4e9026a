//! Choosing how many renderer processes to run.

use crate::utility::{cpu, proc_stats};

/// Logical CPU count assumed when the host cannot be probed.
const FALLBACK_LOGICAL_CPUS: u32 = 8;
/// Worker cap assumed when total RAM cannot be read.
const FALLBACK_RAM_CAP: usize = 4;
/// Headroom multiplier on the per-worker RAM budget.
const RAM_SAFETY_MARGIN: f64 = 1.25;
/// Clamp bounds for the per-worker RAM hint, in GiB.
const RAM_PER_WORKER_MIN: f64 = 4.0;
const RAM_PER_WORKER_MAX: f64 = 256.0;
/// Without MFR each aerender is effectively single-threaded but renders are
/// planned at four cores apiece to leave room for AE's helper processes.
const CORES_PER_WORKER_NO_MFR: u32 = 4;

/// Job hints that shape the worker count.
#[derive(Debug, Clone, Copy)]
pub struct PlannerInputs {
    /// `None` selects auto-sizing.
    pub concurrency_hint: Option<usize>,
    pub max_concurrency: usize,
    pub ram_per_worker_gib: f64,
    pub mfr_enabled: bool,
    pub mfr_threads: u32,
}

/// What the planner knows about the host.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    pub logical_cpus: u32,
    pub physical_cpus: u32,
    pub total_ram_gib: Option<f64>,
}

impl HostResources {
    pub fn detect() -> Self {
        let logical = cpu::logical_cpu_count().unwrap_or(FALLBACK_LOGICAL_CPUS);
        let physical = cpu::physical_cpu_count().unwrap_or(logical);
        Self {
            logical_cpus: logical,
            physical_cpus: physical,
            total_ram_gib: proc_stats::total_ram_gib(),
        }
    }
}

/// Pick the worker count. A hint >= 1 is honored directly; auto mode caps by
/// RAM budget and physical cores, with MFR-enabled renders planned as fewer,
/// heavier workers. The result never exceeds the frame count.
pub fn choose_concurrency(
    inputs: &PlannerInputs,
    host: &HostResources,
    total_frames: i64,
) -> usize {
    let frames = total_frames.max(1) as usize;

    if let Some(hint) = inputs.concurrency_hint {
        return hint.max(1).min(frames);
    }

    let per = inputs
        .ram_per_worker_gib
        .clamp(RAM_PER_WORKER_MIN, RAM_PER_WORKER_MAX);
    let ram_cap = match host.total_ram_gib {
        Some(ram) => ((ram / (per * RAM_SAFETY_MARGIN)).floor() as usize).max(1),
        None => FALLBACK_RAM_CAP,
    };

    let cores_per_worker = if inputs.mfr_enabled {
        inputs.mfr_threads.max(1)
    } else {
        CORES_PER_WORKER_NO_MFR
    };
    let core_cap = ((host.physical_cpus / cores_per_worker) as usize).max(1);

    let chosen = ram_cap
        .min(core_cap)
        .min(inputs.max_concurrency.max(1))
        .max(1)
        .min(frames);

    log::info!(
        "auto concurrency: {chosen} (ram cap {ram_cap}, core cap {core_cap}, max {})",
        inputs.max_concurrency
    );
    chosen
}
