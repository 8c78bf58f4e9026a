//! CLI parsing and the immutable job configuration record.
//!
//! This code should be careful about interpreting values: it parses, applies
//! defaults, and resolves the handful of things that must be resolved exactly
//! once (the aerender binary, env overrides), then hands the rest of the
//! program a read-only [`Config`]. All tunables live here; nothing else in
//! the crate reads the process arguments or environment except the
//! `STMPO_DEBUG` echo flag captured below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

/// Appended when `--output` names a directory rather than a file or pattern.
pub const DEFAULT_OUTPUT_PATTERN: &str = "[#####].png";

/// Hosts reporting more than this many logical CPUs default to affinity
/// disabled unless the operator re-enables it.
pub const AFFINITY_AUTO_DISABLE_CPUS: u32 = 64;

const ABOUT_TEXT: &str = "\
    Split one After Effects render task across parallel pinned aerender \
    processes on this host.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "stmpo", about = ABOUT_TEXT, version)]
#[clap(next_display_order = None)]
pub struct CliOptions {
    /// Path to the .aep project file
    #[clap(long, value_name = "path")]
    pub project: PathBuf,

    /// Output directory, or a full aerender output pattern
    #[clap(long, value_name = "path")]
    pub output: String,

    /// Start frame (inclusive)
    #[clap(long, value_name = "frame", allow_hyphen_values = true)]
    pub start: i64,

    /// End frame (inclusive)
    #[clap(long, value_name = "frame", allow_hyphen_values = true)]
    pub end: i64,

    /// Comp name to render
    #[clap(long, value_name = "name")]
    pub comp: Option<String>,

    /// Render queue index
    #[clap(long, value_name = "index")]
    pub rqindex: Option<u32>,

    /// Render Settings template
    #[clap(long = "rs_template", value_name = "name")]
    pub rs_template: Option<String>,

    /// Output Module template
    #[clap(long = "om_template", value_name = "name")]
    pub om_template: Option<String>,

    /// Filename pattern appended when --output names a directory
    #[clap(long = "output_pattern", value_name = "pattern", default_value = DEFAULT_OUTPUT_PATTERN)]
    pub output_pattern: String,

    /// Treat --output as a full output pattern even if it looks like a directory
    #[clap(long = "output_is_pattern")]
    pub output_is_pattern: bool,

    /// Worker count; >= 1 forces, 0 or -1 selects auto
    #[clap(long, value_name = "N", default_value_t = -1, allow_hyphen_values = true)]
    pub concurrency: i64,

    /// Upper cap on the worker count, auto mode included
    #[clap(long = "max_concurrency", value_name = "N", default_value_t = 24)]
    pub max_concurrency: usize,

    /// Auto-mode RAM budget per worker, in GiB
    #[clap(long = "ram_per_process_gb", value_name = "GiB", default_value_t = 8.0)]
    pub ram_per_process_gb: f64,

    /// Threads per worker when MFR is on
    #[clap(long = "mfr_threads", value_name = "N", default_value_t = 2)]
    pub mfr_threads: u32,

    /// Disable multi-frame rendering in each worker
    #[clap(long = "disable_mfr")]
    pub disable_mfr: bool,

    /// Path to the aerender executable; falls back to $AERENDER_PATH, then $PATH
    #[clap(long = "aerender_path", value_name = "path")]
    pub aerender_path: Option<PathBuf>,

    /// Path to the NUMA map JSON
    #[clap(long = "numa_map", value_name = "path")]
    pub numa_map: Option<PathBuf>,

    /// Never set CPU affinity
    #[clap(long = "disable_affinity", conflicts_with = "enable_affinity")]
    pub disable_affinity: bool,

    /// Keep affinity on even on hosts with more than 64 logical CPUs
    #[clap(long = "enable_affinity")]
    pub enable_affinity: bool,

    /// Seconds to wait between launching children
    #[clap(long = "spawn_delay", value_name = "seconds", default_value_t = 2.0)]
    pub spawn_delay: f64,

    /// Seconds to wait after terminate before force-killing a child
    #[clap(long = "child_grace_sec", value_name = "seconds", default_value_t = 10)]
    pub child_grace_sec: u64,

    /// A failed worker fails the job once in-flight workers finish (default)
    #[clap(long = "kill_on_fail", overrides_with = "no_kill_on_fail")]
    pub kill_on_fail: bool,

    /// Downgrade worker failures to warnings while siblings run
    #[clap(long = "no_kill_on_fail")]
    pub no_kill_on_fail: bool,

    /// Terminate all siblings and exit as soon as any worker fails
    #[clap(long = "kill_siblings_on_fail")]
    pub kill_siblings_on_fail: bool,

    /// JSON file of environment variable overrides for the children
    #[clap(long = "env_file", value_name = "path")]
    pub env_file: Option<PathBuf>,

    /// Duplicate the consolidated log into this file
    #[clap(long = "log_file", value_name = "path")]
    pub log_file: Option<PathBuf>,

    /// Root under which the per-job scratch directory is created
    #[clap(long = "scratch_root", value_name = "path")]
    pub scratch_root: Option<PathBuf>,

    /// Log level of output written on stdout
    #[clap(long = "log_level", short = 'l', value_name = "level", default_value = "info")]
    pub log_level: LogLevel,

    /// Log the per-worker commands and affinity plan, then exit
    #[clap(long = "dry_run")]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// The immutable job configuration, built once from CLI + environment +
/// defaults and passed down by reference.
#[derive(Debug)]
pub struct Config {
    pub project: PathBuf,
    pub output: String,
    pub output_pattern: String,
    pub output_is_pattern: bool,
    pub start: i64,
    pub end: i64,
    pub comp: Option<String>,
    pub rqindex: Option<u32>,
    pub rs_template: Option<String>,
    pub om_template: Option<String>,
    pub concurrency_hint: Option<usize>,
    pub max_concurrency: usize,
    pub ram_per_worker_gib: f64,
    pub mfr_enabled: bool,
    pub mfr_threads: u32,
    pub aerender: PathBuf,
    pub numa_map: Option<PathBuf>,
    pub affinity_disabled: bool,
    pub affinity_explicitly_enabled: bool,
    pub spawn_delay: Duration,
    pub child_grace: Duration,
    pub kill_on_fail: bool,
    pub kill_siblings_on_fail: bool,
    pub env_overrides: Vec<(String, String)>,
    pub scratch_root: PathBuf,
    pub dry_run: bool,
    /// `STMPO_DEBUG=1`: echo full child command lines.
    pub debug_commands: bool,
}

impl Config {
    /// Validate and resolve the parsed options. Any error here is an input
    /// error; the caller maps it to the invalid-input exit code.
    pub fn from_cli(cli: CliOptions) -> anyhow::Result<Config> {
        if cli.start > cli.end {
            anyhow::bail!("invalid frame range: start={} > end={}", cli.start, cli.end);
        }
        if !cli.project.is_file() {
            anyhow::bail!("project not found: {}", cli.project.display());
        }

        let aerender = resolve_aerender(cli.aerender_path.as_deref())?;

        let env_overrides = match &cli.env_file {
            Some(path) => load_env_overrides(path)?,
            None => Vec::new(),
        };

        let concurrency_hint = (cli.concurrency >= 1).then_some(cli.concurrency as usize);

        Ok(Config {
            project: cli.project,
            output: cli.output,
            output_pattern: cli.output_pattern,
            output_is_pattern: cli.output_is_pattern,
            start: cli.start,
            end: cli.end,
            comp: cli.comp,
            rqindex: cli.rqindex,
            rs_template: cli.rs_template,
            om_template: cli.om_template,
            concurrency_hint,
            max_concurrency: cli.max_concurrency,
            ram_per_worker_gib: cli.ram_per_process_gb,
            mfr_enabled: !cli.disable_mfr,
            mfr_threads: cli.mfr_threads,
            aerender,
            numa_map: cli.numa_map,
            affinity_disabled: cli.disable_affinity,
            affinity_explicitly_enabled: cli.enable_affinity,
            spawn_delay: Duration::from_secs_f64(cli.spawn_delay.max(0.0)),
            child_grace: Duration::from_secs(cli.child_grace_sec),
            kill_on_fail: !cli.no_kill_on_fail,
            kill_siblings_on_fail: cli.kill_siblings_on_fail,
            env_overrides,
            scratch_root: cli.scratch_root.unwrap_or_else(std::env::temp_dir),
            dry_run: cli.dry_run,
            debug_commands: std::env::var("STMPO_DEBUG").map(|v| v == "1").unwrap_or(false),
        })
    }

    pub fn total_frames(&self) -> i64 {
        self.end - self.start + 1
    }
}

/// Locate the aerender executable: explicit flag, then `AERENDER_PATH`, then
/// a `PATH` lookup.
fn resolve_aerender(flag: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = flag {
        if !path.is_file() {
            anyhow::bail!("aerender not found: {}", path.display());
        }
        return Ok(path.to_path_buf());
    }

    if let Some(env_path) = std::env::var_os("AERENDER_PATH") {
        let path = PathBuf::from(env_path);
        if !path.is_file() {
            anyhow::bail!("AERENDER_PATH points to a missing file: {}", path.display());
        }
        return Ok(path);
    }

    which::which("aerender")
        .context("aerender not found; pass --aerender_path or set AERENDER_PATH")
}

/// Load a flat `{"KEY": "value"}` JSON map of environment overrides.
pub fn load_env_overrides(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading env file {}", path.display()))?;
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("parsing env file {}", path.display()))?;

    let mut overrides = Vec::with_capacity(map.len());
    for (key, value) in map {
        let serde_json::Value::String(value) = value else {
            anyhow::bail!("env file {}: value for {key:?} is not a string", path.display());
        };
        overrides.push((key, value));
    }
    Ok(overrides)
}
