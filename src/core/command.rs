//! Building aerender command lines and routing the output path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::core::configuration::Config;
use crate::core::frame_range::Subrange;

/// Extensions that mean "a single video container". Rendering one of these
/// from several processes at once corrupts the file, so such jobs are refused.
const VIDEO_EXTS: &[&str] = &["mov", "mp4", "mxf", "avi", "mkv"];

/// Extensions that make `--output` look like a file rather than a directory.
const OUTPUT_FILE_EXTS: &[&str] = &[
    "png", "exr", "jpg", "jpeg", "tif", "tiff", "dpx", "mov", "mp4", "avi", "mxf", "mkv",
];

/// Resolve `--output` into the final aerender output pattern. A bare
/// directory gets the default frame pattern appended; a single-video output
/// with concurrency > 1 is refused before anything is spawned.
pub fn resolve_output(cfg: &Config, concurrency: usize) -> anyhow::Result<PathBuf> {
    let out = cfg.output.as_str();

    let looks_like_pattern = out.contains('[') || out.contains('#');
    let looks_like_file = extension_of(out)
        .map(|ext| OUTPUT_FILE_EXTS.contains(&ext.as_str()))
        .unwrap_or(false);

    let resolved = if cfg.output_is_pattern || looks_like_pattern || looks_like_file {
        PathBuf::from(out)
    } else {
        Path::new(out).join(&cfg.output_pattern)
    };

    if concurrency > 1 && is_single_video(&resolved) {
        anyhow::bail!(
            "output {} looks like a single video file but concurrency is {concurrency}; \
             parallel rendering would corrupt it. Render an image sequence or pass \
             --concurrency 1",
            resolved.display()
        );
    }

    Ok(resolved)
}

/// True when `path` names one video container with no sequence pattern.
pub fn is_single_video(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.contains('[') || name.contains('#') {
        return false;
    }
    extension_of(name)
        .map(|ext| VIDEO_EXTS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// The per-child output path: the final pattern's basename, rerooted into the
/// job's scratch directory.
pub fn scratch_output(final_pattern: &Path, scratch: &Path) -> PathBuf {
    match final_pattern.file_name() {
        Some(name) => scratch.join(name),
        None => scratch.to_path_buf(),
    }
}

/// Render the argv for one child. The trailing `100` satisfies `-mfr`'s
/// percentage syntax even when MFR is off.
pub fn build_aerender_cmd(cfg: &Config, subrange: &Subrange, output: &Path) -> Vec<OsString> {
    let mut cmd: Vec<OsString> = vec![
        cfg.aerender.clone().into(),
        "-project".into(),
        cfg.project.clone().into(),
        "-output".into(),
        output.into(),
        "-sound".into(),
        "OFF".into(),
        "-s".into(),
        subrange.start.to_string().into(),
        "-e".into(),
        subrange.end.to_string().into(),
    ];

    if let Some(comp) = &cfg.comp {
        cmd.push("-comp".into());
        cmd.push(comp.into());
    }
    if let Some(rqindex) = cfg.rqindex {
        cmd.push("-rqindex".into());
        cmd.push(rqindex.to_string().into());
    }
    if let Some(rs) = &cfg.rs_template {
        cmd.push("-RStemplate".into());
        cmd.push(rs.into());
    }
    if let Some(om) = &cfg.om_template {
        cmd.push("-OMtemplate".into());
        cmd.push(om.into());
    }

    cmd.push("-mfr".into());
    cmd.push(if cfg.mfr_enabled { "ON" } else { "OFF" }.into());
    cmd.push("100".into());

    cmd
}

/// One displayable line for dry runs and `STMPO_DEBUG` echoing.
pub fn display_cmd(cmd: &[OsString]) -> String {
    cmd.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::DEFAULT_OUTPUT_PATTERN;

    fn config() -> Config {
        Config {
            project: "/jobs/shot.aep".into(),
            output: "/renders/shot".into(),
            output_pattern: DEFAULT_OUTPUT_PATTERN.to_string(),
            output_is_pattern: false,
            start: 0,
            end: 99,
            comp: None,
            rqindex: None,
            rs_template: None,
            om_template: None,
            concurrency_hint: None,
            max_concurrency: 24,
            ram_per_worker_gib: 8.0,
            mfr_enabled: true,
            mfr_threads: 2,
            aerender: "/opt/ae/aerender".into(),
            numa_map: None,
            affinity_disabled: false,
            affinity_explicitly_enabled: false,
            spawn_delay: std::time::Duration::from_secs(2),
            child_grace: std::time::Duration::from_secs(10),
            kill_on_fail: true,
            kill_siblings_on_fail: false,
            env_overrides: Vec::new(),
            scratch_root: std::env::temp_dir(),
            dry_run: false,
            debug_commands: false,
        }
    }

    #[test]
    fn directory_output_gets_default_pattern() {
        let out = resolve_output(&config(), 4).unwrap();
        assert_eq!(out, Path::new("/renders/shot").join(DEFAULT_OUTPUT_PATTERN));
    }

    #[test]
    fn explicit_pattern_kept_verbatim() {
        let mut cfg = config();
        cfg.output = "/renders/shot/frame_[####].exr".into();
        let out = resolve_output(&cfg, 4).unwrap();
        assert_eq!(out, PathBuf::from("/renders/shot/frame_[####].exr"));
    }

    #[test]
    fn single_video_refused_when_parallel() {
        let mut cfg = config();
        cfg.output = "/renders/out.mov".into();
        assert!(resolve_output(&cfg, 4).is_err());
        // fine with a single worker
        assert!(resolve_output(&cfg, 1).is_ok());
    }

    #[test]
    fn video_with_sequence_pattern_allowed() {
        let mut cfg = config();
        cfg.output = "/renders/out_[###].mov".into();
        assert!(resolve_output(&cfg, 4).is_ok());
    }

    #[test]
    fn output_is_pattern_bypasses_directory_heuristic_not_refusal() {
        let mut cfg = config();
        cfg.output = "/renders/out.mov".into();
        cfg.output_is_pattern = true;
        assert!(resolve_output(&cfg, 2).is_err());

        cfg.output = "/renders/seq".into();
        let out = resolve_output(&cfg, 2).unwrap();
        assert_eq!(out, PathBuf::from("/renders/seq"));
    }

    #[test]
    fn scratch_rerooting_keeps_basename() {
        let out = scratch_output(
            Path::new("/renders/shot/frame_[####].png"),
            Path::new("/scratch/job_0a1b2c3d"),
        );
        assert_eq!(out, PathBuf::from("/scratch/job_0a1b2c3d/frame_[####].png"));
    }

    #[test]
    fn minimal_command_line() {
        let cfg = config();
        let sub = Subrange {
            index: 0,
            start: 5,
            end: 9,
        };
        let cmd = build_aerender_cmd(&cfg, &sub, Path::new("/scratch/x/[#####].png"));
        let strs: Vec<String> = cmd.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        assert_eq!(
            strs,
            vec![
                "/opt/ae/aerender",
                "-project",
                "/jobs/shot.aep",
                "-output",
                "/scratch/x/[#####].png",
                "-sound",
                "OFF",
                "-s",
                "5",
                "-e",
                "9",
                "-mfr",
                "ON",
                "100"
            ]
        );
    }

    #[test]
    fn optional_flags_in_contract_order() {
        let mut cfg = config();
        cfg.comp = Some("MainComp".into());
        cfg.rqindex = Some(3);
        cfg.rs_template = Some("Best".into());
        cfg.om_template = Some("EXR".into());
        cfg.mfr_enabled = false;
        let sub = Subrange {
            index: 0,
            start: 0,
            end: 1,
        };
        let cmd = build_aerender_cmd(&cfg, &sub, Path::new("/s/[#].png"));
        let strs: Vec<String> = cmd.iter().map(|s| s.to_string_lossy().into_owned()).collect();
        let tail: Vec<&str> = strs.iter().map(|s| s.as_str()).skip(11).collect();
        assert_eq!(
            tail,
            vec![
                "-comp",
                "MainComp",
                "-rqindex",
                "3",
                "-RStemplate",
                "Best",
                "-OMtemplate",
                "EXR",
                "-mfr",
                "OFF",
                "100"
            ]
        );
    }
}
