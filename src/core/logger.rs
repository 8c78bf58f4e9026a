//! The consolidated log backend.
//!
//! All orchestrator output — startup diagnostics, PID-tagged child lines,
//! heartbeats — goes through the [`log`] facade into one queue drained by a
//! dedicated writer thread, so records never interleave mid-line no matter
//! which thread produced them. Optionally duplicates the stream into a log
//! file.

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::{Lazy, OnceCell};

/// The writer thread flushes at least this often even without a flush request.
const MAX_WRITE_DELAY: Duration = Duration::from_secs(5);

static STMPO_LOGGER: Lazy<StmpoLogger> = Lazy::new(StmpoLogger::new);

/// Initialize the global logger. Call once, before any other thread logs.
pub fn init(max_level: LevelFilter, log_file: Option<&Path>) -> anyhow::Result<()> {
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("opening log file {}: {e}", path.display()))?;
        STMPO_LOGGER
            .file
            .set(std::sync::Mutex::new(file))
            .ok()
            .unwrap();
    }

    log::set_logger(&*STMPO_LOGGER)?;
    log::set_max_level(max_level);

    std::thread::Builder::new()
        .name("stmpo-logger".to_string())
        .spawn(|| STMPO_LOGGER.writer_thread_fn())?;

    // Flush whatever is queued if we go down screaming.
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        STMPO_LOGGER.flush_sync();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

struct StmpoLogger {
    sender: Sender<LoggerCommand>,
    // Taken and held by the writer thread for its lifetime.
    receiver: std::sync::Mutex<Receiver<LoggerCommand>>,
    file: OnceCell<std::sync::Mutex<std::fs::File>>,
    start: Instant,
}

enum LoggerCommand {
    Write(LogLine),
    // Ack channel so callers can block until the queue has drained.
    Flush(Sender<()>),
}

struct LogLine {
    elapsed: Duration,
    level: Level,
    thread: String,
    message: String,
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_secs = self.elapsed.as_secs();
        write!(
            f,
            "[{:02}:{:02}:{:02}.{:06}] [{:<5}] [{}] {}",
            total_secs / 3600,
            (total_secs / 60) % 60,
            total_secs % 60,
            self.elapsed.subsec_micros(),
            self.level,
            self.thread,
            self.message
        )
    }
}

impl StmpoLogger {
    fn new() -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded();
        Self {
            sender,
            receiver: std::sync::Mutex::new(receiver),
            file: OnceCell::new(),
            start: Instant::now(),
        }
    }

    fn writer_thread_fn(&self) {
        let receiver = self.receiver.lock().unwrap();
        loop {
            match receiver.recv_timeout(MAX_WRITE_DELAY) {
                Ok(LoggerCommand::Write(line)) => self.write_line(&line),
                Ok(LoggerCommand::Flush(ack)) => {
                    // drain everything already queued, then acknowledge
                    while let Ok(cmd) = receiver.try_recv() {
                        match cmd {
                            LoggerCommand::Write(line) => self.write_line(&line),
                            LoggerCommand::Flush(other) => {
                                let _ = other.send(());
                            }
                        }
                    }
                    self.flush_writers();
                    let _ = ack.send(());
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => self.flush_writers(),
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn write_line(&self, line: &LogLine) {
        let stdout = std::io::stdout();
        let mut stdout = stdout.lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();

        if let Some(file) = self.file.get() {
            let mut file = file.lock().unwrap();
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush_writers(&self) {
        let _ = std::io::stdout().lock().flush();
        if let Some(file) = self.file.get() {
            let _ = file.lock().unwrap().flush();
        }
    }

    fn flush_sync(&self) {
        let (ack_sender, ack_receiver) = crossbeam::channel::bounded(1);
        if self.sender.send(LoggerCommand::Flush(ack_sender)).is_ok() {
            let _ = ack_receiver.recv_timeout(Duration::from_secs(2));
        }
    }
}

impl Log for StmpoLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = LogLine {
            elapsed: self.start.elapsed(),
            level: record.level(),
            thread: std::thread::current().name().unwrap_or("?").to_string(),
            message: std::fmt::format(*record.args()),
        };

        let _ = self.sender.send(LoggerCommand::Write(line));

        if record.level() <= Level::Error {
            // errors usually precede an exit; make sure they land
            self.flush_sync();
        }
    }

    fn flush(&self) {
        self.flush_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format() {
        let line = LogLine {
            elapsed: Duration::from_micros(3_723_000_042),
            level: Level::Warn,
            thread: "main".to_string(),
            message: "hello".to_string(),
        };
        assert_eq!(format!("{line}"), "[01:02:03.000042] [WARN ] [main] hello");
    }
}
