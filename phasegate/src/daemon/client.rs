//! Client side of the daemon socket: connect, spawn on demand, bounded retry.

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::daemon::protocol::{Request, Response};
use crate::io::config::PhasegateConfig;
use crate::io::lock::try_lock_exclusive;
use crate::io::paths::{PhasegatePaths, RUNTIME_DIR_ENV};

const FIRST_RETRY: Duration = Duration::from_millis(10);
const MAX_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing was sent; retrying elsewhere is safe.
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
    /// The request may or may not have been applied.
    #[error("daemon connection lost mid-request: {0}")]
    Interrupted(#[source] io::Error),
    #[error("malformed daemon response: {0}")]
    Malformed(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct Client {
    paths: PhasegatePaths,
    config: PhasegateConfig,
    daemon_program: Option<PathBuf>,
}

impl Client {
    pub fn new(paths: PhasegatePaths, config: PhasegateConfig) -> Self {
        Self {
            paths,
            config,
            daemon_program: std::env::current_exe().ok(),
        }
    }

    /// Spawn daemons from `program` instead of the current executable.
    pub fn with_daemon_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.daemon_program = Some(program.into());
        self
    }

    /// Send one request, starting the daemon if nobody is listening.
    pub fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = self.connect_or_spawn()?;
        self.exchange(stream, request)
    }

    /// Send only if a daemon is already listening.
    pub fn send_existing(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.paths.socket_path)
            .map_err(|err| ClientError::Unavailable(format!("connect: {}", err)))?;
        self.exchange(stream, request)
    }

    fn exchange(&self, stream: UnixStream, request: &Request) -> Result<Response, ClientError> {
        let timeout = self.config.request_timeout();
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
            .map_err(|err| ClientError::Unavailable(format!("configure socket: {}", err)))?;

        let mut line = serde_json::to_vec(request).map_err(ClientError::Malformed)?;
        line.push(b'\n');
        let mut writer = &stream;
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|err| ClientError::Unavailable(format!("send: {}", err)))?;

        let mut reader = BufReader::new(&stream);
        let mut reply = String::new();
        let read = reader.read_line(&mut reply).map_err(ClientError::Interrupted)?;
        if read == 0 {
            return Err(ClientError::Interrupted(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed the connection",
            )));
        }
        serde_json::from_str(&reply).map_err(ClientError::Malformed)
    }

    fn connect_or_spawn(&self) -> Result<UnixStream, ClientError> {
        let socket = &self.paths.socket_path;
        let first_err = match UnixStream::connect(socket) {
            Ok(stream) => return Ok(stream),
            Err(err) => err,
        };
        debug!(socket = %socket.display(), err = %first_err, "daemon not reachable");
        if !self.config.spawn_daemon {
            return Err(ClientError::Unavailable(format!(
                "connect: {} (spawning disabled)",
                first_err
            )));
        }

        self.remove_stale_socket();
        self.spawn_daemon()
            .map_err(|err| ClientError::Unavailable(format!("spawn daemon: {}", err)))?;
        self.connect_with_backoff()
    }

    /// A socket file nobody holds the instance lock for is left over from a dead daemon.
    fn remove_stale_socket(&self) {
        let socket = &self.paths.socket_path;
        if !socket.exists() {
            return;
        }
        match try_lock_exclusive(&self.paths.daemon_lock_path) {
            Ok(Some(_free)) => {
                info!(socket = %socket.display(), "removing stale daemon socket");
                if let Err(err) = std::fs::remove_file(socket) {
                    warn!(err = %err, "failed to remove stale socket");
                }
            }
            Ok(None) => debug!("daemon lock held; socket is live or starting"),
            Err(err) => warn!(err = %err, "cannot inspect daemon lock"),
        }
    }

    fn spawn_daemon(&self) -> io::Result<()> {
        let program = self.daemon_program.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "cannot resolve phasegate executable")
        })?;
        std::fs::create_dir_all(&self.paths.phasegate_dir)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.daemon_log_path)?;

        let mut command = Command::new(program);
        command
            .arg("--workspace")
            .arg(&self.paths.root)
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .process_group(0);
        if let Some(runtime_dir) = self.paths.socket_path.parent() {
            command.env(RUNTIME_DIR_ENV, runtime_dir);
        }
        let mut child = command.spawn()?;
        info!(pid = child.id(), "spawned daemon");
        // Reap the child if it exits while this process is still alive.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    fn connect_with_backoff(&self) -> Result<UnixStream, ClientError> {
        let budget = self.config.spawn_budget();
        let started = Instant::now();
        let mut delay = FIRST_RETRY;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match UnixStream::connect(&self.paths.socket_path) {
                Ok(stream) => {
                    debug!(
                        attempts,
                        elapsed_ms = started.elapsed().as_millis(),
                        "connected to spawned daemon"
                    );
                    return Ok(stream);
                }
                Err(err) => {
                    let elapsed = started.elapsed();
                    if elapsed >= budget {
                        return Err(ClientError::Unavailable(format!(
                            "daemon did not accept connections within {}ms ({} attempts): {}",
                            budget.as_millis(),
                            attempts,
                            err
                        )));
                    }
                    thread::sleep(delay.min(budget - elapsed));
                    delay = (delay * 2).min(MAX_RETRY);
                }
            }
        }
    }
}
