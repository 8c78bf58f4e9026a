//! The supervisor: spawn, stream, heartbeat, detect stalls, account exits.
//!
//! Single owner of the worker table. Reader threads only hold the sending
//! half of the log queue; everything else funnels through the loop in
//! [`Supervisor::run`], which never blocks longer than the heartbeat
//! interval.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use nix::unistd::Pid;

use crate::core::affinity;
use crate::core::configuration::Config;
use crate::core::frame_range::Subrange;
use crate::core::shutdown;
use crate::core::worker::{self, LogMessage, Worker};
use crate::utility::event::Event;
use crate::utility::proc_stats;

/// Per-worker status lines are emitted this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// A worker silent for this long is terminated.
pub const LOG_SILENCE_TIMEOUT: Duration = Duration::from_secs(300);
/// Consecutive all-stuck heartbeats before launch-stalled workers are killed.
pub const ZERO_CPU_STUCK_HEARTBEATS: u32 = 4;
/// CPU% at or below this counts as "not doing anything".
const ZERO_CPU_EPSILON: f64 = 0.01;
/// Blocking CPU sample window inside a heartbeat.
const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on the log-queue wait at the top of each loop iteration.
const LOG_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// In-band failure signatures scanned on every child line. The match is
/// case-insensitive and returns the reason recorded on the worker.
pub fn failure_signature(line: &str) -> Option<&'static str> {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error code: 14") || lower.contains("unexpected error occurred while exporting")
    {
        return Some("After Effects Error Code 14");
    }
    if lower.contains("could not be found") && lower.contains(".tif") {
        return Some("Rendered frame missing on disk");
    }
    None
}

/// True when a line shows the child has begun real render work.
pub fn is_progress_signature(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("progress:")
        || lower.contains("starting composition")
        || lower.contains("finished composition")
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionOutcome {
    AllSucceeded,
    JobFailed,
    Cancelled,
}

pub struct Supervisor<'a> {
    cfg: &'a Config,
    shutdown: Arc<Event>,
    workers: Vec<Worker>,
    log_rx: Receiver<LogMessage>,
    log_tx: Sender<LogMessage>,
    // PIDs we already asked the OS to terminate; keeps escalation idempotent.
    terminated_pids: HashSet<i32>,
    job_failed: bool,
    // consecutive heartbeats where every progress-less worker sat at zero CPU
    zero_cpu_rounds: u32,
    last_heartbeat: Instant,
}

impl<'a> Supervisor<'a> {
    pub fn new(cfg: &'a Config, shutdown: Arc<Event>) -> Self {
        let (log_tx, log_rx) = crossbeam::channel::unbounded();
        Supervisor {
            cfg,
            shutdown,
            workers: Vec::new(),
            log_rx,
            log_tx,
            terminated_pids: HashSet::new(),
            job_failed: false,
            zero_cpu_rounds: 0,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn workers_mut(&mut self) -> &mut [Worker] {
        &mut self.workers
    }

    /// Spawn one child per subrange with the configured stagger delay,
    /// applying the matching affinity block after each spawn. Fails only when
    /// not a single worker could be started.
    pub fn spawn_all(
        &mut self,
        subranges: &[Subrange],
        blocks: &[Vec<u32>],
        local_output: &Path,
    ) -> anyhow::Result<()> {
        log::info!(
            "starting spawn sequence, {} worker(s), {:.1}s stagger",
            subranges.len(),
            self.cfg.spawn_delay.as_secs_f64()
        );

        for subrange in subranges {
            if self.shutdown.is_set() {
                break;
            }
            if subrange.index > 0 && !self.cfg.spawn_delay.is_zero() {
                // stagger to avoid license/IO storms; a shutdown cuts it short
                if self.shutdown.wait_timeout(self.cfg.spawn_delay) {
                    break;
                }
            }

            log::info!("launching worker #{} for frames {subrange}", subrange.index);
            match worker::spawn_worker(self.cfg, *subrange, local_output, &self.log_tx) {
                Ok(mut w) => {
                    if let Some(block) = blocks.get(subrange.index) {
                        w.affinity = affinity::apply_to_process(Pid::from_raw(w.pid), block);
                    }
                    log::info!("worker #{} is PID {}", subrange.index, w.pid);
                    self.workers.push(w);
                }
                Err(e) => {
                    log::error!("failed to spawn worker #{}: {e:#}", subrange.index);
                    self.job_failed = true;
                }
            }
        }

        if self.workers.is_empty() {
            anyhow::bail!("no workers were spawned");
        }
        Ok(())
    }

    /// Supervise until every worker reaches a terminal state, a sibling-kill
    /// policy fires, or the shutdown event is set.
    pub fn run(&mut self) -> SupervisionOutcome {
        self.last_heartbeat = Instant::now();

        loop {
            let drained_any = self.drain_logs();

            if self.shutdown.is_set() {
                return SupervisionOutcome::Cancelled;
            }

            if self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                self.heartbeat();
                self.last_heartbeat = Instant::now();
            }

            self.check_exits();

            if self.job_failed
                && self.cfg.kill_siblings_on_fail
                && self.workers.iter().any(|w| w.is_running())
            {
                log::error!("a worker failed; terminating siblings (kill_siblings_on_fail)");
                shutdown::terminate_workers(&mut self.workers, self.cfg.child_grace);
                self.check_exits();
                break;
            }

            self.check_log_silence();

            if self.workers.iter().all(|w| !w.is_running()) {
                break;
            }

            let wait = if drained_any {
                Duration::from_millis(50)
            } else {
                let until_heartbeat =
                    HEARTBEAT_INTERVAL.saturating_sub(self.last_heartbeat.elapsed());
                until_heartbeat.clamp(Duration::from_millis(200), Duration::from_secs(2))
            };
            if self.shutdown.wait_timeout(wait) {
                return SupervisionOutcome::Cancelled;
            }
        }

        self.final_report()
    }

    /// Log the final per-worker accounting and produce the job outcome.
    fn final_report(&self) -> SupervisionOutcome {
        let bad: Vec<String> = self
            .workers
            .iter()
            .filter(|w| !w.succeeded())
            .map(|w| match (w.exit_code, w.failure) {
                (_, Some(reason)) => format!("PID {} ({reason})", w.pid),
                (Some(Some(code)), None) => format!("PID {} (exit {code})", w.pid),
                _ => format!("PID {} (killed)", w.pid),
            })
            .collect();

        if bad.is_empty() && !self.job_failed {
            log::info!("all workers succeeded");
            SupervisionOutcome::AllSucceeded
        } else {
            log::error!("job failed; bad workers: [{}]", bad.join(", "));
            SupervisionOutcome::JobFailed
        }
    }

    // Wait briefly for the first line, then drain whatever else is queued.
    fn drain_logs(&mut self) -> bool {
        let Ok(first) = self.log_rx.recv_timeout(LOG_DRAIN_WAIT) else {
            return false;
        };
        self.ingest_line(first);
        while let Ok(msg) = self.log_rx.try_recv() {
            self.ingest_line(msg);
        }
        true
    }

    fn ingest_line(&mut self, msg: LogMessage) {
        log::info!("[PID {} {}] {}", msg.pid, msg.tag, msg.line);

        let Some(w) = self.workers.iter_mut().find(|w| w.pid == msg.pid) else {
            return;
        };
        w.last_log_at = Instant::now();
        w.last_log_line = msg.line.clone();
        if is_progress_signature(&msg.line) {
            w.progress_seen = true;
        }

        if let Some(reason) = failure_signature(&msg.line) {
            if w.failure.is_none() {
                log::error!("PID {}: detected in-band failure: {reason}", msg.pid);
                w.failure = Some(reason);
                self.job_failed = true;
                // terminate to expedite the outer task's retry
                self.request_termination(msg.pid);
            }
        }
    }

    fn heartbeat(&mut self) {
        let running: Vec<i32> = self
            .workers
            .iter()
            .filter(|w| w.is_running())
            .map(|w| w.pid)
            .collect();
        let cpu = proc_stats::sample_cpu_percent(&running, CPU_SAMPLE_INTERVAL);

        for w in &mut self.workers {
            let cpu_pct = cpu.get(&w.pid).copied();
            let rss_mib = proc_stats::rss_bytes(w.pid)
                .map(|b| b / (1024 * 1024))
                .unwrap_or(0);

            log::info!(
                "heartbeat: #{index} pid={pid} state={state} elapsed={elapsed}s cpu={cpu} \
                 rss={rss_mib}MiB affinity={affinity} rc={rc} last={last:?}",
                index = w.subrange.index,
                pid = w.pid,
                state = w.state(),
                elapsed = w.spawned_at.elapsed().as_secs(),
                cpu = cpu_pct
                    .map(|c| format!("{c:.1}%"))
                    .unwrap_or_else(|| "n/a".to_string()),
                affinity = w
                    .affinity
                    .as_ref()
                    .map(|a| format!("{} cpus", a.len()))
                    .unwrap_or_else(|| "none".to_string()),
                rc = w
                    .exit_code
                    .map(|c| c.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))
                    .unwrap_or_else(|| "-".to_string()),
                last = w.last_log_line,
            );

            if w.is_running() && !w.progress_seen {
                if cpu_pct.unwrap_or(0.0) <= ZERO_CPU_EPSILON {
                    w.zero_cpu_streak += 1;
                } else {
                    w.zero_cpu_streak = 0;
                }
            }
        }

        self.evaluate_zero_cpu_stall();
    }

    // Launch-stuck detection: aerender instances that never reach actual
    // render work sit at zero CPU with no progress signature. When every such
    // worker has been idle for two heartbeats we warn; after four consecutive
    // stuck heartbeats (and a minimum runtime so slow project loads are not
    // punished) they are all terminated so the outer task can retry.
    fn evaluate_zero_cpu_stall(&mut self) {
        let stalled: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_running() && !w.progress_seen)
            .map(|(i, _)| i)
            .collect();

        let all_stuck =
            !stalled.is_empty() && stalled.iter().all(|&i| self.workers[i].zero_cpu_streak >= 2);
        if !all_stuck {
            self.zero_cpu_rounds = 0;
            return;
        }

        self.zero_cpu_rounds += 1;
        for &i in &stalled {
            let pid = self.workers[i].pid;
            log::warn!(
                "worker #{index} appears launch-stuck at zero CPU; process tree: {tree}",
                index = self.workers[i].subrange.index,
                tree = proc_stats::describe_process_tree(pid),
            );
        }

        let min_runtime = stalled
            .iter()
            .map(|&i| self.workers[i].spawned_at.elapsed())
            .min()
            .unwrap_or(Duration::ZERO);

        if self.zero_cpu_rounds >= ZERO_CPU_STUCK_HEARTBEATS
            && min_runtime > 4 * HEARTBEAT_INTERVAL
        {
            log::error!(
                "all {} remaining worker(s) stuck at zero CPU for {} heartbeats; terminating",
                stalled.len(),
                self.zero_cpu_rounds
            );
            self.job_failed = true;
            for &i in &stalled {
                self.workers[i].failure = Some("Stalled at launch with zero CPU");
                let pid = self.workers[i].pid;
                self.request_termination(pid);
            }
        }
    }

    fn check_exits(&mut self) {
        for w in &mut self.workers {
            if !w.is_running() {
                continue;
            }
            match w.child.try_wait() {
                Ok(Some(status)) => {
                    w.exit_code = Some(status.code());
                    if w.succeeded() {
                        log::info!(
                            "PID {} completed frames {} with exit 0",
                            w.pid,
                            w.subrange
                        );
                    } else {
                        let detail = match status.code() {
                            Some(code) => format!("exit code {code}"),
                            None => "killed by signal".to_string(),
                        };
                        if self.cfg.kill_on_fail {
                            log::error!("PID {} failed ({detail})", w.pid);
                        } else {
                            log::warn!("PID {} failed ({detail})", w.pid);
                        }
                        self.job_failed = true;
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("polling PID {} failed: {e}", w.pid),
            }
        }
    }

    fn check_log_silence(&mut self) {
        let silent: Vec<(i32, usize, Duration)> = self
            .workers
            .iter()
            .filter(|w| w.is_running() && !self.terminated_pids.contains(&w.pid))
            .filter(|w| w.last_log_at.elapsed() >= LOG_SILENCE_TIMEOUT)
            .map(|w| (w.pid, w.subrange.index, w.last_log_at.elapsed()))
            .collect();

        for (pid, index, silence) in silent {
            log::error!(
                "worker #{index} (PID {pid}) produced no output for {}s; terminating",
                silence.as_secs()
            );
            self.request_termination(pid);
        }
    }

    // Idempotent graceful terminate; the exit is recorded by check_exits.
    fn request_termination(&mut self, pid: i32) {
        if !self.terminated_pids.insert(pid) {
            return;
        }
        if let Some(w) = self.workers.iter_mut().find(|w| w.pid == pid) {
            w.termination_requested = true;
        }
        shutdown::send_terminate(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::DEFAULT_OUTPUT_PATTERN;
    use std::process::{Command, Stdio};

    fn test_config() -> Config {
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
            spawn_delay: Duration::from_secs(0),
            child_grace: Duration::from_secs(2),
            kill_on_fail: true,
            kill_siblings_on_fail: false,
            env_overrides: Vec::new(),
            scratch_root: std::env::temp_dir(),
            dry_run: false,
            debug_commands: false,
        }
    }

    fn sleeper(index: usize) -> Worker {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let now = Instant::now();
        Worker {
            subrange: Subrange {
                index,
                start: 0,
                end: 0,
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
            exit_code: None,
            failure: None,
        }
    }

    #[test]
    fn in_band_failure_terminates_only_that_worker() {
        let cfg = test_config();
        let shutdown = Arc::new(Event::new());
        let mut sup = Supervisor::new(&cfg, shutdown);
        sup.workers.push(sleeper(0));
        sup.workers.push(sleeper(1));
        let failing_pid = sup.workers[0].pid;

        sup.log_tx
            .send(LogMessage {
                pid: failing_pid,
                tag: "LOG",
                line: "After Effects error: (Error code: 14)".to_string(),
            })
            .unwrap();
        assert!(sup.drain_logs());

        assert_eq!(sup.workers[0].failure, Some("After Effects Error Code 14"));
        assert!(sup.workers[0].termination_requested);
        assert!(sup.job_failed);
        assert!(sup.workers[1].failure.is_none());
        assert!(!sup.workers[1].termination_requested);

        // a repeated signature stays idempotent
        sup.log_tx
            .send(LogMessage {
                pid: failing_pid,
                tag: "LOG",
                line: "Error code: 14 again".to_string(),
            })
            .unwrap();
        sup.drain_logs();
        assert_eq!(sup.terminated_pids.len(), 1);

        shutdown::terminate_workers(&mut sup.workers, Duration::from_secs(5));
    }

    #[test]
    fn progress_lines_update_worker_state() {
        let cfg = test_config();
        let mut sup = Supervisor::new(&cfg, Arc::new(Event::new()));
        sup.workers.push(sleeper(0));
        let pid = sup.workers[0].pid;

        sup.log_tx
            .send(LogMessage {
                pid,
                tag: "LOG",
                line: "PROGRESS: 0;00;00;05: rendered".to_string(),
            })
            .unwrap();
        sup.drain_logs();

        assert!(sup.workers[0].progress_seen);
        assert_eq!(sup.workers[0].last_log_line, "PROGRESS: 0;00;00;05: rendered");
        assert!(!sup.job_failed);

        shutdown::terminate_workers(&mut sup.workers, Duration::from_secs(5));
    }

    #[test]
    fn error_14_signatures() {
        assert_eq!(
            failure_signature("After Effects error: (Error code: 14)"),
            Some("After Effects Error Code 14")
        );
        assert_eq!(
            failure_signature("aerender ERROR: An unexpected error occurred while exporting"),
            Some("After Effects Error Code 14")
        );
        assert_eq!(failure_signature("PROGRESS: 0:00:01: frame ok"), None);
    }

    #[test]
    fn missing_frame_signature_needs_both_parts() {
        assert_eq!(
            failure_signature("File frame_0012.tif could not be found"),
            Some("Rendered frame missing on disk")
        );
        assert_eq!(failure_signature("frame_0012.tif written"), None);
        assert_eq!(failure_signature("the comp could not be found"), None);
    }

    #[test]
    fn progress_signatures() {
        assert!(is_progress_signature("PROGRESS: 0;00;00;01 (2): 0 Seconds"));
        assert!(is_progress_signature("Starting composition \"Main\""));
        assert!(is_progress_signature("Finished composition \"Main\""));
        assert!(!is_progress_signature("Launching After Effects"));
    }
}
