//! Per-workspace daemon: one Unix socket, one serialized request handler.
//!
//! Connections are handled one at a time on the accept thread, so at most one
//! load-apply-save is in flight. Each mutation additionally holds the
//! workspace state lock, which keeps the degraded fallback path consistent
//! with the daemon. The in-memory cache is trusted only while the state file's
//! fingerprint is unchanged.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::command::Command;
use crate::core::engine::{Env, Next, apply};
use crate::core::types::{ProtocolError, WorkflowState};
use crate::daemon::protocol::{Control, Parsed, Request, Response};
use crate::io::config::PhasegateConfig;
use crate::io::lock::{FileLock, try_lock_exclusive};
use crate::io::paths::PhasegatePaths;
use crate::io::state_store::{Fingerprint, StateStore};

const INSTANCE_LOCK_ATTEMPTS: u32 = 5;
const INSTANCE_LOCK_RETRY: Duration = Duration::from_millis(20);

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Another daemon already owns this workspace.
    AlreadyRunning,
    Idle,
    Shutdown,
}

/// Run the daemon for `paths.root` until idle timeout or `shutdown`.
#[instrument(skip_all, fields(root = %paths.root.display()))]
pub fn run(paths: &PhasegatePaths, config: &PhasegateConfig) -> Result<Exit> {
    let Some(mut instance) = acquire_instance_lock(&paths.daemon_lock_path)
        .with_context(|| format!("lock {}", paths.daemon_lock_path.display()))?
    else {
        info!("another daemon owns this workspace");
        return Ok(Exit::AlreadyRunning);
    };
    if let Err(err) = instance.write_note(&process::id().to_string()) {
        warn!(err = %err, "failed to record daemon pid");
    }

    // Holding the instance lock means any socket file left here is stale.
    match fs::remove_file(&paths.socket_path) {
        Ok(()) => info!(socket = %paths.socket_path.display(), "removed stale socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("remove stale socket {}", paths.socket_path.display()));
        }
    }
    let listener = UnixListener::bind(&paths.socket_path)
        .with_context(|| format!("bind {}", paths.socket_path.display()))?;
    info!(socket = %paths.socket_path.display(), pid = process::id(), "daemon listening");

    let exit = serve(listener, paths, config);

    // Remove the socket before the instance lock drops so a successor never loses its own.
    if let Err(err) = fs::remove_file(&paths.socket_path) {
        warn!(err = %err, "failed to remove socket on exit");
    }
    drop(instance);
    info!(?exit, "daemon stopped");
    Ok(exit)
}

/// Clients hold the instance lock for a moment while checking for a stale
/// socket, so a starting daemon retries briefly before deferring to an owner.
fn acquire_instance_lock(path: &Path) -> io::Result<Option<FileLock>> {
    for attempt in 1..=INSTANCE_LOCK_ATTEMPTS {
        if let Some(lock) = try_lock_exclusive(path)? {
            return Ok(Some(lock));
        }
        if attempt < INSTANCE_LOCK_ATTEMPTS {
            thread::sleep(INSTANCE_LOCK_RETRY);
        }
    }
    Ok(None)
}

fn serve(listener: UnixListener, paths: &PhasegatePaths, config: &PhasegateConfig) -> Exit {
    let started = Instant::now();
    let activity = Arc::new(Activity::new(started, config.idle_timeout()));
    spawn_idle_watcher(paths, &activity);

    let mut handler = Handler::new(StateStore::new(paths), started);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(err = %err, "accept failed");
                continue;
            }
        };
        if let Some(exit) = serve_one(stream, &mut handler, &activity, config.request_timeout()) {
            return exit;
        }
    }
    Exit::Idle
}

/// Serve one accepted connection, then decide whether the daemon should stop.
///
/// Every connection is read before idleness is considered, so a client that
/// races the watcher's wake-up is still answered. Only a connection that
/// carried no request may end the loop as idle.
fn serve_one(
    stream: UnixStream,
    handler: &mut Handler,
    activity: &Activity,
    timeout: Duration,
) -> Option<Exit> {
    // A connection that failed part-way is treated as activity.
    let quiet = match handle_connection(stream, handler, timeout) {
        Ok(served) => served == 0,
        Err(err) => {
            debug!(err = %err, "connection ended with error");
            false
        }
    };
    if !quiet {
        activity.touch();
    }
    if handler.shutdown_requested {
        return Some(Exit::Shutdown);
    }
    if quiet && activity.is_idle() {
        return Some(Exit::Idle);
    }
    None
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Time of the last served request, shared with the idle watcher.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
    idle_timeout: Duration,
}

impl Activity {
    fn new(started: Instant, idle_timeout: Duration) -> Self {
        Self {
            started,
            last_ms: AtomicU64::new(0),
            idle_timeout,
        }
    }

    fn touch(&self) {
        self.last_ms.store(elapsed_ms(self.started), Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        let quiet_ms = elapsed_ms(self.started).saturating_sub(self.last_ms.load(Ordering::SeqCst));
        Duration::from_millis(quiet_ms) >= self.idle_timeout
    }
}

/// Pokes the socket while idle so the blocking accept loop re-checks.
///
/// The watcher stops once the serve loop drops its [`Activity`].
fn spawn_idle_watcher(paths: &PhasegatePaths, activity: &Arc<Activity>) {
    let socket_path = paths.socket_path.clone();
    let tick = (activity.idle_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
    let activity = Arc::downgrade(activity);
    thread::spawn(move || {
        loop {
            thread::sleep(tick);
            let Some(activity) = activity.upgrade() else {
                return;
            };
            if activity.is_idle() {
                info!(idle_secs = activity.idle_timeout.as_secs(), "idle timeout reached");
                let _ = UnixStream::connect(&socket_path);
            }
        }
    });
}

/// Answer every request line on `stream`; returns how many were served.
fn handle_connection(
    stream: UnixStream,
    handler: &mut Handler,
    timeout: Duration,
) -> io::Result<u64> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();
    let mut served = 0;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(served);
        }
        if line.trim().is_empty() {
            continue;
        }
        served += 1;
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handler.handle(&request),
            Err(err) => Response::error(&ProtocolError::invalid(format!(
                "malformed request: {}",
                err
            ))),
        };
        let mut buf = serde_json::to_vec(&response).map_err(io::Error::other)?;
        buf.push(b'\n');
        writer.write_all(&buf)?;
        writer.flush()?;
        if handler.shutdown_requested {
            return Ok(served);
        }
    }
}

struct Cached {
    state: Option<WorkflowState>,
    fingerprint: Option<Fingerprint>,
}

/// Owns the store and the write-through cache.
pub struct Handler {
    store: StateStore,
    cache: Option<Cached>,
    started: Instant,
    requests: u64,
    shutdown_requested: bool,
}

impl Handler {
    pub fn new(store: StateStore, started: Instant) -> Self {
        Self {
            store,
            cache: None,
            started,
            requests: 0,
            shutdown_requested: false,
        }
    }

    pub fn handle(&mut self, request: &Request) -> Response {
        self.requests += 1;
        debug!(command = %request.command, "request");
        let result = match request.parse() {
            Ok(Parsed::Engine(command)) => self.execute(&command),
            Ok(Parsed::Control(Control::Ping)) => Ok(self.ping()),
            Ok(Parsed::Control(Control::Shutdown)) => {
                info!("shutdown requested");
                self.shutdown_requested = true;
                Ok(json!({ "shutting_down": true }))
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            debug!(
                command = %request.command,
                kind = %err.kind,
                message = %err.message,
                "request rejected"
            );
        }
        Response::from_result(result)
    }

    fn ping(&self) -> Value {
        json!({
            "pid": process::id(),
            "uptime_ms": elapsed_ms(self.started),
            "requests": self.requests,
            "workspace_root": self.store.root(),
        })
    }

    fn execute(&mut self, command: &Command) -> Result<Value, ProtocolError> {
        let _lock = if command.is_read_only() {
            None
        } else {
            Some(self.store.lock()?)
        };
        let current = self.current()?;
        let env = Env {
            workspace_root: self.store.root(),
            now: Utc::now(),
        };
        let applied = apply(current.as_ref(), command, &env);
        if let Err(err) = self.store.commit(&applied.next) {
            self.cache = None;
            return Err(err.into());
        }
        match applied.next {
            Next::Unchanged => {}
            Next::Replace(state) => {
                self.cache = Some(Cached {
                    state: Some(state),
                    fingerprint: self.store.fingerprint(),
                });
            }
            Next::Clear => {
                self.cache = Some(Cached {
                    state: None,
                    fingerprint: None,
                });
            }
        }
        applied.reply
    }

    /// Cached state if the file is unchanged since we last saw it, else a fresh load.
    fn current(&mut self) -> Result<Option<WorkflowState>, ProtocolError> {
        let fingerprint = self.store.fingerprint();
        if let Some(cached) = &self.cache {
            if cached.fingerprint == fingerprint {
                return Ok(cached.state.clone());
            }
            debug!("state file changed outside the daemon; reloading");
        }
        let state = self.store.load()?;
        self.cache = Some(Cached {
            state: state.clone(),
            fingerprint,
        });
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phases::Phase;
    use crate::core::types::{ErrorKind, WorkflowType};
    use crate::test_support::TempWorkspace;

    fn send(handler: &mut Handler, command: Command) -> Result<Value, ProtocolError> {
        handler.handle(&Request::from_command(&command)).into_result()
    }

    #[test]
    fn handler_persists_mutations() {
        let ws = TempWorkspace::new();
        let mut handler = Handler::new(StateStore::new(&ws.paths), Instant::now());
        send(&mut handler, Command::Init {
            workflow_type: WorkflowType::QuickFix,
        })
        .expect("init");
        send(&mut handler, Command::StartPhase {
            phase: Phase::Input,
        })
        .expect("start");

        let on_disk = StateStore::new(&ws.paths).load().expect("load").expect("state");
        assert_eq!(on_disk.current_phase, Some(Phase::Input));
    }

    /// A write made behind the daemon's back (fallback path) must not be lost.
    #[test]
    fn handler_reloads_after_external_write() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        let mut handler = Handler::new(store.clone(), Instant::now());
        send(&mut handler, Command::Init {
            workflow_type: WorkflowType::QuickFix,
        })
        .expect("init");

        let mut external = store.load().expect("load").expect("state");
        external.design_hash = Some("external".to_string());
        external.checkpoints.clear();
        store.save(&external).expect("save");

        send(&mut handler, Command::Checkpoint {
            agent: "a".to_string(),
        })
        .expect("checkpoint");
        let state = store.load().expect("load").expect("state");
        assert_eq!(state.design_hash.as_deref(), Some("external"));
        assert_eq!(state.checkpoints.len(), 1);
    }

    #[test]
    fn handler_reports_engine_errors_and_ping() {
        let ws = TempWorkspace::new();
        let mut handler = Handler::new(StateStore::new(&ws.paths), Instant::now());
        let err = send(&mut handler, Command::Confirm).expect_err("no workflow");
        assert_eq!(err.kind, ErrorKind::InvalidCommand);

        let ping = handler
            .handle(&Request::control(Control::Ping))
            .into_result()
            .expect("ping");
        assert_eq!(ping["pid"], process::id());
        assert_eq!(ping["requests"], 2);
    }

    fn handler(ws: &TempWorkspace) -> Handler {
        Handler::new(StateStore::new(&ws.paths), Instant::now())
    }

    /// A request arriving after the idle deadline is still answered and keeps the daemon up.
    #[test]
    fn request_racing_idle_wakeup_is_served() {
        let ws = TempWorkspace::new();
        let mut handler = handler(&ws);
        let activity = Activity::new(Instant::now(), Duration::ZERO);
        assert!(activity.is_idle());

        let (mut client, server) = UnixStream::pair().expect("socket pair");
        let mut line = serde_json::to_vec(&Request::from_command(&Command::Init {
            workflow_type: WorkflowType::QuickFix,
        }))
        .expect("encode");
        line.push(b'\n');
        client.write_all(&line).expect("send");
        client.shutdown(std::net::Shutdown::Write).expect("half close");

        let exit = serve_one(server, &mut handler, &activity, Duration::from_secs(1));
        assert_eq!(exit, None);

        let mut reply = String::new();
        BufReader::new(&client).read_line(&mut reply).expect("reply");
        let response: Response = serde_json::from_str(&reply).expect("response");
        response.into_result().expect("init applied");
        assert!(ws.paths.state_path.exists());
    }

    #[test]
    fn empty_connection_while_idle_stops_daemon() {
        let ws = TempWorkspace::new();
        let mut handler = handler(&ws);
        let (client, server) = UnixStream::pair().expect("socket pair");
        drop(client);

        let idle = Activity::new(Instant::now(), Duration::ZERO);
        assert_eq!(
            serve_one(server, &mut handler, &idle, Duration::from_secs(1)),
            Some(Exit::Idle)
        );

        let (client, server) = UnixStream::pair().expect("socket pair");
        drop(client);
        let busy = Activity::new(Instant::now(), Duration::from_secs(60));
        assert_eq!(serve_one(server, &mut handler, &busy, Duration::from_secs(1)), None);
    }

    #[test]
    fn shutdown_request_stops_daemon() {
        let ws = TempWorkspace::new();
        let mut handler = handler(&ws);
        let (mut client, server) = UnixStream::pair().expect("socket pair");
        client.write_all(b"{\"command\":\"shutdown\"}\n").expect("send");
        client.shutdown(std::net::Shutdown::Write).expect("half close");
        let busy = Activity::new(Instant::now(), Duration::from_secs(60));
        assert_eq!(
            serve_one(server, &mut handler, &busy, Duration::from_secs(1)),
            Some(Exit::Shutdown)
        );
    }

    #[test]
    fn instance_lock_waits_out_a_brief_holder() {
        let ws = TempWorkspace::new();
        let checker = try_lock_exclusive(&ws.paths.daemon_lock_path)
            .expect("lock")
            .expect("free");
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(checker);
        });
        let lock = acquire_instance_lock(&ws.paths.daemon_lock_path).expect("lock");
        release.join().expect("join");
        assert!(lock.is_some());
    }

    #[test]
    fn instance_lock_defers_to_running_daemon() {
        let ws = TempWorkspace::new();
        let _owner = try_lock_exclusive(&ws.paths.daemon_lock_path)
            .expect("lock")
            .expect("free");
        let lock = acquire_instance_lock(&ws.paths.daemon_lock_path).expect("lock");
        assert!(lock.is_none());
    }

    #[test]
    fn completing_workflow_removes_state_file() {
        let ws = TempWorkspace::new();
        let mut handler = Handler::new(StateStore::new(&ws.paths), Instant::now());
        send(&mut handler, Command::Init {
            workflow_type: WorkflowType::AnalyzeOnly,
        })
        .expect("init");
        for phase in Phase::ALL {
            send(&mut handler, Command::StartPhase { phase }).expect("start");
            send(&mut handler, Command::CompletePhase { phase }).expect("complete");
        }
        assert!(!ws.paths.state_path.exists());
        let active = send(&mut handler, Command::IsActive).expect("is-active");
        assert_eq!(active["active"], false);
    }
}
