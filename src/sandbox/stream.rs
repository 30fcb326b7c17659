//! Line fan-out for sandbox execution output.
//!
//! Reader threads pull lines off the exec streams; the calling thread
//! hands each line to every attached sink and keeps the full capture. A sink
//! that errors is detached and recorded, the rest keep receiving lines. The
//! host-side deadline is enforced here as well.

use super::ExecHandle;
use crate::error::ForgeError;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A consumer of execution output lines. Lines keep their trailing newline.
pub trait LineSink: Send {
    fn accept(&mut self, line: &str) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Echoes lines for live observation.
pub struct EchoSink {
    to_stdout: bool,
}

impl EchoSink {
    pub fn new(to_stdout: bool) -> Self {
        Self { to_stdout }
    }
}

impl LineSink for EchoSink {
    fn accept(&mut self, line: &str) -> io::Result<()> {
        if self.to_stdout {
            use std::io::Write;
            let mut out = io::stdout().lock();
            out.write_all(line.as_bytes())?;
            out.flush()?;
        } else {
            info!(target: "fuzzforge::sandbox::output", "{}", line.trim_end());
        }
        Ok(())
    }
}

/// Distributes each line to a set of named sinks.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<(String, Box<dyn LineSink>)>,
    failures: Vec<(String, String)>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, name: impl Into<String>, sink: Box<dyn LineSink>) {
        self.sinks.push((name.into(), sink));
    }

    pub fn record_failure(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.failures.push((name.into(), reason.into()));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn dispatch(&mut self, line: &str) {
        let mut i = 0;
        while i < self.sinks.len() {
            match self.sinks[i].1.accept(line) {
                Ok(()) => i += 1,
                Err(e) => {
                    let (name, _) = self.sinks.remove(i);
                    warn!(sink = %name, error = %e, "Detaching failed output sink");
                    self.failures.push((name, e.to_string()));
                }
            }
        }
    }

    /// Finishes every remaining sink and returns all recorded failures.
    pub fn close(mut self) -> Vec<(String, String)> {
        for (name, mut sink) in self.sinks.drain(..) {
            if let Err(e) = sink.finish() {
                warn!(sink = %name, error = %e, "Output sink failed to finish");
                self.failures.push((name, e.to_string()));
            }
        }
        self.failures
    }
}

/// What came out of one streamed execution.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub status: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

/// Pumps the exec output through `fanout` until EOF or `deadline`, then reaps
/// the process. On deadline the process is killed and `status` is `None`.
///
/// Stdout and stderr are read on separate threads that feed one channel, so
/// the capture holds both in arrival order, interleaved per line.
pub fn pump(
    mut handle: Box<dyn ExecHandle>,
    fanout: &mut FanOut,
    deadline: Duration,
) -> Result<StreamOutcome, ForgeError> {
    let stdout = handle.take_output().ok_or_else(|| ForgeError::Runtime {
        operation: "exec".to_string(),
        reason: "output stream unavailable".to_string(),
    })?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = vec![spawn_reader(stdout, tx.clone())];
    if let Some(stderr) = handle.take_errors() {
        readers.push(spawn_reader(stderr, tx.clone()));
    }
    drop(tx);

    let start = Instant::now();
    let mut outcome = StreamOutcome::default();
    loop {
        let remaining = deadline.saturating_sub(start.elapsed());
        match rx.recv_timeout(remaining) {
            Ok(line) => {
                fanout.dispatch(&line);
                outcome.output.push_str(&line);
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!(deadline_secs = deadline.as_secs(), "Host-side deadline hit, killing exec");
                outcome.timed_out = true;
                if let Err(e) = handle.kill() {
                    warn!(error = %e, "Failed to kill exec process");
                }
                // Lines already buffered before the kill still count.
                while let Ok(line) = rx.try_recv() {
                    fanout.dispatch(&line);
                    outcome.output.push_str(&line);
                }
                break;
            }
        }
    }

    match handle.wait() {
        Ok(status) if !outcome.timed_out => {
            for reader in readers {
                let _ = reader.join();
            }
            outcome.status = status;
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to reap exec process, exit status unknown"),
    }

    Ok(outcome)
}

fn spawn_reader(
    stream: Box<dyn Read + Send>,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}
