//! Entry point: wire the planners, scratch, offloader, and supervisor
//! together and map every outcome to one process exit code.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;

use crate::core::affinity;
use crate::core::command;
use crate::core::configuration::{CliOptions, Config, AFFINITY_AUTO_DISABLE_CPUS};
use crate::core::frame_range;
use crate::core::logger;
use crate::core::offload::{Offloader, DEFAULT_MIN_QUIET_AGE};
use crate::core::planner::{self, HostResources, PlannerInputs};
use crate::core::scratch::ScratchDir;
use crate::core::shutdown;
use crate::core::supervisor::{SupervisionOutcome, Supervisor};
use crate::core::topology;
use crate::utility::event::Event;

pub const EXIT_SUCCESS: i32 = 0;
/// Any worker failed, or the orchestration itself broke mid-job.
pub const EXIT_FAILED: i32 = 1;
/// Bad inputs: range, missing project or aerender, single-video parallel job.
pub const EXIT_INVALID_INPUT: i32 = 2;
/// Cancelled by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: i32 = 3;

/// Main entry point for the orchestrator. Returns the process exit code.
pub fn run_stmpo(args: Vec<OsString>) -> i32 {
    let options = match CliOptions::try_parse_from(args) {
        Ok(x) => x,
        Err(e) => {
            // prints to stdout or stderr with clap's formatting
            e.print().unwrap();
            return if e.use_stderr() {
                EXIT_INVALID_INPUT
            } else {
                // --help / --version
                EXIT_SUCCESS
            };
        }
    };

    if let Err(e) = logger::init(options.log_level.into(), options.log_file.as_deref()) {
        eprintln!("could not initialize logging: {e:#}");
        return EXIT_FAILED;
    }

    run_job(options)
}

fn run_job(options: CliOptions) -> i32 {
    let cfg = match Config::from_cli(options) {
        Ok(cfg) => cfg,
        Err(e) => {
            log_error_chain(&e);
            return EXIT_INVALID_INPUT;
        }
    };

    log::info!("stmpo {} starting", env!("CARGO_PKG_VERSION"));
    log::info!(
        "project={} frames={}-{} output={}",
        cfg.project.display(),
        cfg.start,
        cfg.end,
        cfg.output
    );
    log_environment();

    let host = HostResources::detect();
    log::info!(
        "host: {} logical / {} physical CPUs, {} RAM",
        host.logical_cpus,
        host.physical_cpus,
        host.total_ram_gib
            .map(|r| format!("{r:.0} GiB"))
            .unwrap_or_else(|| "unknown".to_string()),
    );

    let inputs = PlannerInputs {
        concurrency_hint: cfg.concurrency_hint,
        max_concurrency: cfg.max_concurrency,
        ram_per_worker_gib: cfg.ram_per_worker_gib,
        mfr_enabled: cfg.mfr_enabled,
        mfr_threads: cfg.mfr_threads,
    };
    let concurrency = planner::choose_concurrency(&inputs, &host, cfg.total_frames());
    log::info!("using concurrency={concurrency}");

    let subranges = match frame_range::split_ranges(cfg.start, cfg.end, concurrency) {
        Ok(x) => x,
        Err(e) => {
            log_error_chain(&e);
            return EXIT_INVALID_INPUT;
        }
    };

    let final_output = match command::resolve_output(&cfg, concurrency) {
        Ok(x) => x,
        Err(e) => {
            log_error_chain(&e);
            return EXIT_INVALID_INPUT;
        }
    };
    log::info!("resolved output pattern: {}", final_output.display());

    let blocks = plan_affinity(&cfg, &host, concurrency);

    if cfg.dry_run {
        log::info!("dry run: commands and affinity plan only");
        for subrange in &subranges {
            let cmd = command::build_aerender_cmd(&cfg, subrange, &final_output);
            let block = blocks.get(subrange.index);
            log::info!(
                "[DRY] #{} frames {subrange} affinity={block:?} cmd={}",
                subrange.index,
                command::display_cmd(&cmd)
            );
        }
        return EXIT_SUCCESS;
    }

    let shutdown_event = Arc::new(Event::new());
    if let Err(e) = shutdown::install_signal_handlers(Arc::clone(&shutdown_event)) {
        log_error_chain(&e);
        return EXIT_FAILED;
    }

    let scratch = match ScratchDir::create(&cfg.scratch_root) {
        Ok(x) => x,
        Err(e) => {
            log_error_chain(&e);
            return EXIT_FAILED;
        }
    };
    let local_output = command::scratch_output(&final_output, scratch.path());
    let dest_dir = final_output
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let mut offloader = match Offloader::start(
        scratch.path().to_path_buf(),
        dest_dir,
        DEFAULT_MIN_QUIET_AGE,
    ) {
        Ok(x) => x,
        Err(e) => {
            log_error_chain(&e);
            scratch.remove();
            return EXIT_FAILED;
        }
    };

    let mut supervisor = Supervisor::new(&cfg, Arc::clone(&shutdown_event));
    if let Err(e) = supervisor.spawn_all(&subranges, &blocks, &local_output) {
        log_error_chain(&e);
        offloader.stop();
        scratch.remove();
        return EXIT_FAILED;
    }

    let outcome = supervisor.run();

    if outcome == SupervisionOutcome::Cancelled {
        shutdown::terminate_workers(supervisor.workers_mut(), cfg.child_grace);
    }

    // the offloader runs its final drain passes inside stop()
    offloader.stop();
    scratch.remove();

    match outcome {
        SupervisionOutcome::AllSucceeded => {
            log::info!("render task complete");
            EXIT_SUCCESS
        }
        SupervisionOutcome::JobFailed => EXIT_FAILED,
        SupervisionOutcome::Cancelled => {
            log::warn!("render task cancelled by signal");
            EXIT_CANCELLED
        }
    }
}

/// Resolve whether affinity applies and plan the per-worker blocks. Topology
/// problems are never fatal; they just disable pinning.
fn plan_affinity(cfg: &Config, host: &HostResources, concurrency: usize) -> Vec<Vec<u32>> {
    if cfg.affinity_disabled {
        log::info!("affinity disabled by flag");
        return Vec::new();
    }
    if host.logical_cpus > AFFINITY_AUTO_DISABLE_CPUS && !cfg.affinity_explicitly_enabled {
        log::info!(
            "host has {} logical CPUs (> {AFFINITY_AUTO_DISABLE_CPUS}); affinity disabled. \
             Pass --enable_affinity to override",
            host.logical_cpus
        );
        return Vec::new();
    }
    let Some(map_path) = &cfg.numa_map else {
        log::info!("no NUMA map provided; affinity disabled");
        return Vec::new();
    };

    match topology::load_numa_map(map_path) {
        Ok(pools) if pools.is_empty() => {
            log::warn!("no CPU pools found in {}; affinity disabled", map_path.display());
            Vec::new()
        }
        Ok(pools) => {
            let blocks = affinity::plan_blocks(concurrency, &pools);
            log::info!(
                "affinity active: {} blocks built across {} pools",
                blocks.len(),
                pools.len()
            );
            blocks
        }
        Err(e) => {
            log::error!("topology error: {e:#}; affinity disabled");
            Vec::new()
        }
    }
}

fn log_error_chain(e: &anyhow::Error) {
    // log the full error and its context chain, one line per frame
    for line in format!("{e:?}").split('\n') {
        log::error!("{line}");
    }
}

fn log_environment() {
    for (key, value) in std::env::vars_os() {
        let level = match key.to_string_lossy().as_ref() {
            "AERENDER_PATH" | "STMPO_DEBUG" => log::Level::Info,
            _ => log::Level::Trace,
        };
        log::log!(level, "env: {key:?}={value:?}");
    }
}
