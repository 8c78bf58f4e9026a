//! One renderer child process and its log reader.

use std::io::BufRead;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use anyhow::Context;
use crossbeam::channel::Sender;

use crate::core::command;
use crate::core::configuration::Config;
use crate::core::frame_range::Subrange;

/// A line of child output, tagged with its producer. Lines from one PID reach
/// the supervisor in the order the child wrote them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub pid: i32,
    pub tag: &'static str,
    pub line: String,
}

/// Where a worker is in its life. `SpawnPending` exists only between planning
/// and the spawn call; a `Worker` value is always at least `Running`.
/// `Terminated` workers still settle into an exit code once the OS reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Terminated,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Running => "running",
            WorkerState::Terminated => "terminated",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Supervisor-owned record for one renderer process.
#[derive(Debug)]
pub struct Worker {
    pub subrange: Subrange,
    pub child: Child,
    pub pid: i32,
    /// CPU set actually applied, possibly narrower than planned.
    pub affinity: Option<Vec<u32>>,
    pub spawned_at: Instant,
    pub last_log_at: Instant,
    pub last_log_line: String,
    /// A render-progress signature has been seen in this worker's output.
    pub progress_seen: bool,
    /// Consecutive heartbeats at effectively zero CPU with no progress.
    pub zero_cpu_streak: u32,
    /// We asked the OS to terminate this worker.
    pub termination_requested: bool,
    /// `Some(code)` once the OS reported; inner `None` means killed by signal.
    pub exit_code: Option<Option<i32>>,
    /// In-band failure reason, independent of the exit code.
    pub failure: Option<&'static str>,
}

impl Worker {
    pub fn is_running(&self) -> bool {
        self.exit_code.is_none()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(Some(0)) && self.failure.is_none()
    }

    pub fn state(&self) -> WorkerState {
        match self.exit_code {
            None if self.termination_requested => WorkerState::Terminated,
            None => WorkerState::Running,
            Some(Some(0)) if self.failure.is_none() => WorkerState::Completed,
            Some(_) => WorkerState::Failed,
        }
    }
}

/// Spawn one aerender child for `subrange`, stdout and stderr merged into a
/// single pipe drained by a dedicated reader thread.
pub fn spawn_worker(
    cfg: &Config,
    subrange: Subrange,
    output: &Path,
    log_tx: &Sender<LogMessage>,
) -> anyhow::Result<Worker> {
    let argv = command::build_aerender_cmd(cfg, &subrange, output);
    if cfg.debug_commands {
        log::info!("spawn command: {}", command::display_cmd(&argv));
    }

    // One pipe shared by stdout and stderr keeps the two streams merged in
    // write order, like 2>&1.
    let (read_fd, write_fd) = nix::unistd::pipe().context("creating child output pipe")?;
    let write_fd_dup = nix::unistd::dup(write_fd).context("duplicating child output pipe")?;

    let mut builder = Command::new(&argv[0]);
    builder
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(unsafe { Stdio::from_raw_fd(write_fd) })
        .stderr(unsafe { Stdio::from_raw_fd(write_fd_dup) })
        .envs(cfg.env_overrides.iter().map(|(k, v)| (k, v)));

    let reader_file = unsafe { std::fs::File::from_raw_fd(read_fd) };

    let child = builder
        .spawn()
        .with_context(|| format!("spawning {}", argv[0].to_string_lossy()))?;
    let pid = child.id() as i32;

    let log_tx = log_tx.clone();
    std::thread::Builder::new()
        .name(format!("stmpo-reader-{pid}"))
        .spawn(move || reader_thread_fn(pid, reader_file, log_tx))
        .context("starting reader thread")?;

    let now = Instant::now();
    Ok(Worker {
        subrange,
        child,
        pid,
        affinity: None,
        spawned_at: now,
        last_log_at: now,
        last_log_line: String::new(),
        progress_seen: false,
        zero_cpu_streak: 0,
        termination_requested: false,
        exit_code: None,
        failure: None,
    })
}

// Blocks on the child's merged output until EOF (child exited and the pipe's
// write ends are closed). Invalid UTF-8 is replaced, not dropped.
fn reader_thread_fn(pid: i32, file: std::fs::File, log_tx: Sender<LogMessage>) {
    let mut reader = std::io::BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if log_tx
                    .send(LogMessage {
                        pid,
                        tag: "LOG",
                        line,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker(exit_code: Option<Option<i32>>) -> Worker {
        // a real (short-lived) child so the struct has a process handle
        let child = Command::new("true")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let now = Instant::now();
        Worker {
            subrange: Subrange {
                index: 0,
                start: 0,
                end: 1,
            },
            child,
            pid,
            affinity: None,
            spawned_at: now,
            last_log_at: now,
            last_log_line: String::new(),
            progress_seen: false,
            zero_cpu_streak: 0,
            termination_requested: false,
            exit_code,
            failure: None,
        }
    }

    #[test]
    fn state_machine() {
        let mut w = test_worker(None);
        assert_eq!(w.state(), WorkerState::Running);
        assert!(w.is_running());

        w.termination_requested = true;
        assert_eq!(w.state(), WorkerState::Terminated);

        w.exit_code = Some(Some(0));
        assert_eq!(w.state(), WorkerState::Completed);
        assert!(w.succeeded());

        w.failure = Some("After Effects Error Code 14");
        assert_eq!(w.state(), WorkerState::Failed);
        assert!(!w.succeeded());

        let mut w = test_worker(Some(Some(2)));
        w.child.wait().unwrap();
        assert_eq!(w.state(), WorkerState::Failed);

        // killed by signal: exited but with no code
        let mut w = test_worker(Some(None));
        w.child.wait().unwrap();
        assert_eq!(w.state(), WorkerState::Failed);
        assert!(!w.succeeded());
    }
}
