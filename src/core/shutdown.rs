//! Signal handling and ordered teardown of renderer children.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use signal_hook::consts;
use signal_hook::iterator::Signals;

use crate::core::worker::Worker;
use crate::utility::event::Event;
use crate::utility::proc_stats;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
// Short reap window after SIGKILL so exit codes still get recorded.
const KILL_REAP_WINDOW: Duration = Duration::from_secs(2);

/// Set `shutdown` from a dedicated thread when SIGINT or SIGTERM arrives.
pub fn install_signal_handlers(shutdown: Arc<Event>) -> anyhow::Result<()> {
    let mut signals = Signals::new([consts::signal::SIGINT, consts::signal::SIGTERM])?;
    std::thread::Builder::new()
        .name("stmpo-signals".to_string())
        .spawn(move || {
            // blocks until a signal arrives or the iterator is closed
            if let Some(signal) = signals.forever().next() {
                log::warn!("received signal {signal}; stopping workers");
                shutdown.set();
            }
        })?;
    Ok(())
}

/// Ask `pid` to exit. Failures (already-gone processes) are ignored.
pub fn send_terminate(pid: i32) {
    let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
}

/// Terminate every still-running worker: graceful request, a bounded wait,
/// then a recursive force-kill of survivors (descendants first, so renderer
/// helper processes cannot outlive their parent as orphans).
pub fn terminate_workers(workers: &mut [Worker], grace: Duration) {
    for w in workers.iter_mut().filter(|w| w.is_running()) {
        log::warn!("terminating PID {} ...", w.pid);
        w.termination_requested = true;
        send_terminate(w.pid);
    }

    reap_until(workers, grace);

    for w in workers.iter_mut().filter(|w| w.is_running()) {
        log::error!("force killing PID {} and its descendants", w.pid);
        for descendant in proc_stats::descendants(w.pid).into_iter().rev() {
            let _ = nix::sys::signal::kill(Pid::from_raw(descendant), Signal::SIGKILL);
        }
        let _ = nix::sys::signal::kill(Pid::from_raw(w.pid), Signal::SIGKILL);
    }

    reap_until(workers, KILL_REAP_WINDOW);
}

fn reap_until(workers: &mut [Worker], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        for w in workers.iter_mut().filter(|w| w.is_running()) {
            if let Ok(Some(status)) = w.child.try_wait() {
                w.exit_code = Some(status.code());
            }
        }
        if workers.iter().all(|w| !w.is_running()) || Instant::now() >= deadline {
            return;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame_range::Subrange;
    use std::process::{Command, Stdio};

    fn sleeper() -> Worker {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let now = Instant::now();
        Worker {
            subrange: Subrange {
                index: 0,
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
    fn terminate_reaps_within_grace() {
        let mut workers = vec![sleeper(), sleeper()];
        terminate_workers(&mut workers, Duration::from_secs(5));
        for w in &workers {
            assert!(!w.is_running());
            // killed by SIGTERM, so no exit code
            assert_eq!(w.exit_code, Some(None));
            assert!(w.termination_requested);
        }
    }
}
