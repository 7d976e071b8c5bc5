//! Helpers for running child processes with their output streamed to a log file.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

type SharedLog = Arc<Mutex<BufWriter<File>>>;

/// Result of a streamed child process.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    /// Bytes of combined stdout/stderr written to the log.
    pub bytes_logged: u64,
    /// The process outlived the slow-run threshold.
    pub slow: bool,
    pub elapsed: Duration,
}

/// Run a command to completion, appending combined stdout/stderr to `log_path` line by line.
///
/// The log file is created (truncating any leftovers) before the child is spawned, and every
/// line is flushed as it arrives so the log can be tailed while the run is active. Stdin is
/// closed. The child is never killed: once `slow_after` elapses a warning is logged and the
/// wait continues.
#[instrument(skip_all, fields(log_path = %log_path.display(), slow_after_secs = slow_after.as_secs()))]
pub fn run_streaming(mut cmd: Command, log_path: &Path, slow_after: Duration) -> Result<StreamedOutput> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = File::create(log_path)
        .with_context(|| format!("create run log {}", log_path.display()))?;
    let log: SharedLog = Arc::new(Mutex::new(BufWriter::new(file)));

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_log = log.clone();
    let stderr_log = log.clone();
    let stdout_handle = thread::spawn(move || tee_lines(stdout, stdout_log));
    let stderr_handle = thread::spawn(move || tee_lines(stderr, stderr_log));

    let mut slow = false;
    let status = match child.wait_timeout(slow_after).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                slow_after_secs = slow_after.as_secs(),
                "command is still running past the slow-run threshold"
            );
            slow = true;
            child.wait().context("wait for slow command")?
        }
    };

    let stdout_bytes = join_reader(stdout_handle).context("join stdout")?;
    let stderr_bytes = join_reader(stderr_handle).context("join stderr")?;
    log.lock()
        .map_err(|_| anyhow!("run log lock poisoned"))?
        .flush()
        .context("flush run log")?;

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(StreamedOutput {
        status,
        bytes_logged: stdout_bytes + stderr_bytes,
        slow,
        elapsed,
    })
}

/// Append a note line to an existing (or new) run log.
pub fn append_log_line(log_path: &Path, line: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open run log {}", log_path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("write run log {}", log_path.display()))
}

fn join_reader(handle: thread::JoinHandle<Result<u64>>) -> Result<u64> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn tee_lines<R: Read>(reader: R, log: SharedLog) -> Result<u64> {
    let mut buf_reader = BufReader::new(reader);
    let mut total = 0u64;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }
        total += n as u64;

        if let Ok(mut writer) = log.lock() {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to run log");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush run log");
            }
        }
    }

    Ok(total)
}
