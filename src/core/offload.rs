//! Moving stabilized frames from scratch to the final destination.
//!
//! Renderers write into scratch at full speed; this background thread copies
//! finished frames out in small throttled bursts so offload I/O never
//! competes with an in-progress frame write. A file qualifies only once it
//! passes the stability probe: an in-place rename (which fails on Windows
//! while a writer holds the file) plus a minimum quiet age since last
//! modification as the equivalent no-open-writer check elsewhere.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::utility::event::Event;
use crate::utility::proc_stats::modified_at_least;

/// At most this many files are moved per scan.
pub const OFFLOAD_BURST_LIMIT: usize = 5;
/// Sleep after a scan that moved something.
pub const OFFLOAD_SCAN_INTERVAL: Duration = Duration::from_millis(2500);
/// Sleep after a scan that moved nothing.
pub const OFFLOAD_IDLE_INTERVAL: Duration = Duration::from_secs(5);
/// Default quiet age before a file counts as stable.
pub const DEFAULT_MIN_QUIET_AGE: Duration = Duration::from_secs(1);

const PERMISSION_RETRIES: u32 = 3;
const PERMISSION_RETRY_DELAY: Duration = Duration::from_millis(500);
const FINAL_PASSES: u32 = 3;
const FINAL_PASS_DELAY: Duration = Duration::from_secs(1);

/// The background scratch-to-destination mover.
pub struct Offloader {
    stop: Arc<Event>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Offloader {
    /// Pre-create the destination directory and start scanning.
    pub fn start(
        scratch: PathBuf,
        dest_dir: PathBuf,
        min_quiet_age: Duration,
    ) -> anyhow::Result<Offloader> {
        std::fs::create_dir_all(&dest_dir)
            .with_context(|| format!("creating output directory {}", dest_dir.display()))?;

        let stop = Arc::new(Event::new());
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("stmpo-offloader".to_string())
                .spawn(move || offload_loop(&scratch, &dest_dir, min_quiet_age, &stop))?
        };

        Ok(Offloader {
            stop,
            thread: Some(thread),
        })
    }

    /// Signal the thread, let it run its final drain passes, and join it.
    pub fn stop(&mut self) {
        self.stop.set();
        if let Some(handle) = self.thread.take() {
            if let Err(e) = handle.join() {
                log::warn!("offloader thread did not exit cleanly: {e:?}");
            }
        }
    }
}

fn offload_loop(scratch: &Path, dest: &Path, min_quiet_age: Duration, stop: &Event) {
    loop {
        let moved = scan_once(scratch, dest, min_quiet_age, OFFLOAD_BURST_LIMIT);
        let wait = if moved > 0 {
            OFFLOAD_SCAN_INTERVAL
        } else {
            OFFLOAD_IDLE_INTERVAL
        };
        if stop.wait_timeout(wait) {
            break;
        }
    }

    // Final drain: the renderers are gone, so anything still here is either
    // stable or irretrievably locked.
    for pass in 0..FINAL_PASSES {
        if pass > 0 {
            std::thread::sleep(FINAL_PASS_DELAY);
        }
        scan_once(scratch, dest, Duration::ZERO, usize::MAX);
        if list_files(scratch).is_empty() {
            break;
        }
    }

    let remaining = list_files(scratch);
    if !remaining.is_empty() {
        log::warn!(
            "{} file(s) could not be offloaded and remain in scratch: {}",
            remaining.len(),
            remaining
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

/// One scan over scratch: move up to `burst_limit` stable files into `dest`.
/// Returns how many were moved.
fn scan_once(scratch: &Path, dest: &Path, min_quiet_age: Duration, burst_limit: usize) -> usize {
    let mut moved = 0;
    for path in list_files(scratch) {
        if moved >= burst_limit {
            break;
        }
        if !is_stable(&path, min_quiet_age) {
            continue;
        }
        match move_file(&path, dest) {
            Ok(()) => {
                moved += 1;
                log::debug!("offloaded {}", path.display());
            }
            Err(e) => log::warn!("offload of {} failed: {e}", path.display()),
        }
    }
    moved
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}

/// The stability probe: rename the file onto its own name, then require it to
/// have been quiet for `min_quiet_age`.
fn is_stable(path: &Path, min_quiet_age: Duration) -> bool {
    if std::fs::rename(path, path).is_err() {
        return false;
    }
    modified_at_least(path, min_quiet_age)
}

/// Copy-then-delete so cross-volume destinations work. Permission errors
/// (e.g. a scanner briefly holding the destination) are retried a few times.
fn move_file(src: &Path, dest_dir: &Path) -> std::io::Result<()> {
    let name = src
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    let dest = dest_dir.join(name);

    let mut attempt = 0;
    loop {
        match std::fs::copy(src, &dest).and_then(|_| std::fs::remove_file(src)) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied
                && attempt < PERMISSION_RETRIES =>
            {
                attempt += 1;
                std::thread::sleep(PERMISSION_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_files(dir: &Path, n: usize) {
        for i in 0..n {
            std::fs::write(dir.join(format!("frame_{i:04}.png")), format!("data{i}")).unwrap();
        }
    }

    #[test]
    fn burst_limit_caps_each_scan() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        make_files(scratch.path(), 20);

        let moved = scan_once(scratch.path(), dest.path(), Duration::ZERO, OFFLOAD_BURST_LIMIT);
        assert_eq!(moved, 5);
        assert_eq!(list_files(scratch.path()).len(), 15);
        assert_eq!(list_files(dest.path()).len(), 5);
    }

    #[test]
    fn fresh_files_are_skipped() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        make_files(scratch.path(), 3);

        let moved = scan_once(scratch.path(), dest.path(), Duration::from_secs(3600), 5);
        assert_eq!(moved, 0);
        assert_eq!(list_files(scratch.path()).len(), 3);
    }

    #[test]
    fn moved_files_keep_their_bytes_and_leave_no_source() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let src = scratch.path().join("frame.png");
        std::fs::write(&src, b"pixels").unwrap();

        move_file(&src, dest.path()).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(dest.path().join("frame.png")).unwrap(), b"pixels");
    }

    #[test]
    fn stop_drains_remaining_files() {
        let scratch = tempfile::tempdir().unwrap();
        let dest_root = tempfile::tempdir().unwrap();
        let dest = dest_root.path().join("out");
        make_files(scratch.path(), 8);

        let mut offloader =
            Offloader::start(scratch.path().to_path_buf(), dest.clone(), Duration::ZERO).unwrap();
        offloader.stop();

        assert!(list_files(scratch.path()).is_empty());
        assert_eq!(list_files(&dest).len(), 8);
    }
}
