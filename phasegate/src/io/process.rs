//! Run validator commands with a timeout and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured validator output.
#[derive(Debug)]
pub struct ValidatorRun {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated_bytes: usize,
    pub timed_out: bool,
}

impl ValidatorRun {
    /// Exit status 0 within the timeout.
    pub fn passed(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// One-line summary suitable for gate evidence.
    pub fn summary(&self, name: &str) -> String {
        if self.timed_out {
            return format!("{} timed out", name);
        }
        match self.status.code() {
            Some(code) => format!("{} exited {}", name, code),
            None => format!("{} terminated by signal", name),
        }
    }
}

/// Run `argv` in `cwd`, killing it after `timeout`.
///
/// Both pipes are drained on reader threads so a chatty child cannot deadlock.
/// Bytes beyond `output_limit_bytes` per stream are counted and discarded.
#[instrument(
    skip_all,
    fields(
        program = %argv.first().map(String::as_str).unwrap_or(""),
        timeout_secs = timeout.as_secs(),
    )
)]
pub fn run_validator(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ValidatorRun> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("validator command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning validator");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn validator {}", program))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for validator")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "validator timed out, killing");
            timed_out = true;
            child.kill().context("kill validator")?;
            child.wait().context("wait validator after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    let truncated_bytes = stdout_truncated + stderr_truncated;
    if truncated_bytes > 0 {
        warn!(truncated_bytes, "validator output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "validator finished");
    Ok(ValidatorRun {
        status,
        stdout,
        stderr,
        truncated_bytes,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}
