//! Local model-server lifecycle.
//!
//! [`ServerSession`] owns the single server slot and decides between reuse
//! and restart; [`VllmServer`] is the process-backed implementation.

use crate::error::JobError;
use crate::plan::sanitize_name;
use crate::settings::{ModelEntry, RunnerSettings};
use crate::tee::{open_log, spawn_tee, Echo};
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const HEALTH_POLL: Duration = Duration::from_secs(5);

pub trait ModelServer {
    /// Launches the server for `model_id`. Must not block on readiness.
    fn start(&mut self, model_id: u32) -> Result<(), JobError>;

    /// Blocks until the started server signals readiness or `timeout` elapses.
    fn wait_ready(&mut self, timeout: Duration) -> Result<(), JobError>;

    /// Whether the started server is still running.
    fn is_alive(&mut self) -> bool;

    /// Interrupts the server and waits out the drain interval. No-op when idle.
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerAction {
    None,
    Reused,
    Started,
    Restarted { previous: u32 },
    Stopped { previous: u32 },
}

/// The runner's view of the one shared server: which model is loaded, and
/// the handle to start and stop it.
pub struct ServerSession<S: ModelServer> {
    server: S,
    current: Option<u32>,
    readiness_timeout: Duration,
}

impl<S: ModelServer> ServerSession<S> {
    pub fn new(server: S, readiness_timeout: Duration) -> Self {
        Self {
            server,
            current: None,
            readiness_timeout,
        }
    }

    /// Reuses the running server when it already serves `model_id` and is
    /// still alive; otherwise stops whatever runs and starts the requested
    /// model. On a readiness failure the half-started server is torn down.
    pub fn ensure_model(&mut self, model_id: u32) -> Result<ServerAction, JobError> {
        if self.current == Some(model_id) {
            if self.server.is_alive() {
                info!(model_id, "reusing running model server");
                return Ok(ServerAction::Reused);
            }
            warn!(model_id, "model server died since the last job, restarting");
        }
        let previous = self.current.take();
        if let Some(prev) = previous {
            info!(from = prev, to = model_id, "switching model server");
            self.server.stop();
        }

        info!(model_id, "starting model server");
        if let Err(err) = self.server.start(model_id) {
            self.server.stop();
            return Err(err);
        }
        if let Err(err) = self.server.wait_ready(self.readiness_timeout) {
            self.server.stop();
            return Err(err);
        }
        self.current = Some(model_id);
        info!(model_id, "model server ready");
        Ok(match previous {
            Some(previous) => ServerAction::Restarted { previous },
            None => ServerAction::Started,
        })
    }

    /// Stops the server if one is loaded and returns the model it served.
    pub fn release(&mut self) -> Option<u32> {
        let model_id = self.current.take()?;
        info!(model_id, "stopping model server");
        self.server.stop();
        Some(model_id)
    }
}

/// Process group of the running server, shared with whoever must tear it
/// down from outside the job loop (an interrupt handler).
#[derive(Debug, Clone, Default)]
pub struct ServerGroup(Arc<AtomicU32>);

impl ServerGroup {
    pub fn pgid(&self) -> Option<u32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            pgid => Some(pgid),
        }
    }

    fn publish(&self, pgid: u32) {
        self.0.store(pgid, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Interrupts the group, waits `drain`, then kills whatever is left.
    /// Returns the group that was signalled.
    pub fn terminate(&self, drain: Duration) -> Option<u32> {
        let pgid = self.0.swap(0, Ordering::SeqCst);
        if pgid == 0 {
            return None;
        }
        if signal_group(pgid, GroupSignal::Interrupt) {
            thread::sleep(drain);
            if signal_group(pgid, GroupSignal::Probe) {
                signal_group(pgid, GroupSignal::Kill);
            }
        }
        Some(pgid)
    }
}

struct RunningServer {
    child: Child,
    model_id: u32,
    lines: Option<Receiver<String>>,
    log_path: PathBuf,
}

/// Launches the model server as a child process and watches its output for
/// a readiness marker.
pub struct VllmServer {
    launch: Vec<String>,
    cwd: PathBuf,
    log_root: PathBuf,
    markers: Vec<String>,
    drain: Duration,
    health_url: Option<String>,
    models: BTreeMap<u32, ModelEntry>,
    group: ServerGroup,
    running: Option<RunningServer>,
}

impl VllmServer {
    pub fn from_settings(settings: &RunnerSettings) -> Self {
        Self {
            launch: settings.server.launch.clone(),
            cwd: settings.project_root.clone(),
            log_root: settings.log_root(),
            markers: settings.server.readiness_markers.clone(),
            drain: Duration::from_secs(settings.server.drain_secs),
            health_url: settings.server.health_url.clone(),
            models: settings.models.clone(),
            group: ServerGroup::default(),
            running: None,
        }
    }

    /// Publishes the server's process group through `group` while it runs.
    pub fn with_group(mut self, group: ServerGroup) -> Self {
        self.group = group;
        self
    }

    fn server_log_path(&self, model_id: u32) -> PathBuf {
        let name = self
            .models
            .get(&model_id)
            .map(|m| sanitize_name(&m.name))
            .unwrap_or_else(|| "unknown".to_string());
        self.log_root.join("server").join(format!(
            "{}_model{}_{}.log",
            Local::now().format("%Y%m%d_%H%M%S"),
            model_id,
            name
        ))
    }
}

impl ModelServer for VllmServer {
    fn start(&mut self, model_id: u32) -> Result<(), JobError> {
        self.stop();
        let (program, args) = self
            .launch
            .split_first()
            .ok_or_else(|| JobError::malformed("server launch command is empty"))?;
        let log_path = self.server_log_path(model_id);
        let log = open_log(&log_path).map_err(|source| JobError::Spawn {
            program: log_path.display().to_string(),
            source,
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(model_id.to_string())
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|source| JobError::Spawn {
            program: program.clone(),
            source,
        })?;
        self.group.publish(child.id());
        info!(model_id, pid = child.id(), log = %log_path.display(), "model server launched");

        // Readers end on their own once the server's pipes close.
        let (tx, rx) = mpsc::channel();
        if let Some(out) = child.stdout.take() {
            spawn_tee(out, log.clone(), Echo::Stdout, Some(tx.clone()), is_access_log);
        }
        if let Some(err) = child.stderr.take() {
            spawn_tee(err, log, Echo::Stderr, Some(tx), is_access_log);
        }

        self.running = Some(RunningServer {
            child,
            model_id,
            lines: Some(rx),
            log_path,
        });
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), JobError> {
        let health = self.health_url.clone().and_then(|url| {
            reqwest::blocking::Client::builder()
                .timeout(HEALTH_POLL)
                .build()
                .ok()
                .map(|client| (client, url))
        });
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| JobError::malformed("wait_ready called without a started server"))?;
        let model_id = running.model_id;
        let deadline = Instant::now() + timeout;
        let mut next_probe = Instant::now();
        let mut streams_open = true;

        loop {
            if let Ok(Some(status)) = running.child.try_wait() {
                warn!(model_id, %status, log = %running.log_path.display(), "model server exited before ready");
                return Err(JobError::ServerExited {
                    model_id,
                    status: status.to_string(),
                });
            }
            if let Some((client, url)) = &health {
                if Instant::now() >= next_probe {
                    if probe_health(client, url) {
                        info!(model_id, url = %url, "health endpoint answered");
                        running.lines = None;
                        return Ok(());
                    }
                    next_probe = Instant::now() + HEALTH_POLL;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(model_id, log = %running.log_path.display(), "no readiness signal before deadline");
                return Err(JobError::ReadinessTimeout {
                    model_id,
                    timeout_secs: timeout.as_secs(),
                });
            }
            let slice = (deadline - now).min(Duration::from_millis(500));
            if !streams_open {
                thread::sleep(slice);
                continue;
            }
            let received = match &running.lines {
                Some(rx) => rx.recv_timeout(slice),
                None => Err(RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(line) => {
                    if self.markers.iter().any(|m| !m.is_empty() && line.contains(m.as_str())) {
                        debug!(model_id, line = %line, "readiness marker seen");
                        running.lines = None;
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => streams_open = false,
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.running.as_mut() {
            Some(running) => matches!(running.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Signals the whole process group even when the launcher already
    /// exited, so engine workers it left behind go down with it.
    fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        let pid = running.child.id();
        if group_alive(&mut running.child) {
            interrupt(&mut running.child);
            // Fixed drain, not cut short by an early exit.
            thread::sleep(self.drain);
            if group_alive(&mut running.child) {
                warn!(pid, model_id = running.model_id, "server ignored interrupt, killing process group");
                force_kill(&mut running.child);
            }
        }
        let _ = running.child.wait();
        self.group.clear();
        info!(pid, model_id = running.model_id, "model server stopped");
    }
}

impl Drop for VllmServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.as_mut() {
            force_kill(&mut running.child);
            let _ = running.child.wait();
            self.group.clear();
        }
    }
}

/// Successful chat-completion access lines flood the console; they still
/// reach the log file.
fn is_access_log(line: &str) -> bool {
    line.contains("POST /v1/chat/completions") && line.contains("200 OK")
}

fn probe_health(client: &reqwest::blocking::Client, url: &str) -> bool {
    match client.get(url).send() {
        Ok(resp) => resp.status().is_success(),
        Err(err) => {
            debug!(url, error = %err, "health probe failed");
            false
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Probe,
    Interrupt,
    Kill,
}

/// Returns false once no process in the group is left.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: GroupSignal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Probe => None,
        GroupSignal::Interrupt => Some(Signal::SIGINT),
        GroupSignal::Kill => Some(Signal::SIGKILL),
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pgid, error = %err, "failed to signal server process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: GroupSignal) -> bool {
    false
}

/// The server runs in its own process group, keyed by the launcher's pid.
/// Reaping the launcher first keeps its zombie from counting as alive.
#[cfg(unix)]
fn group_alive(child: &mut Child) -> bool {
    let _ = child.try_wait();
    signal_group(child.id(), GroupSignal::Probe)
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    signal_group(child.id(), GroupSignal::Interrupt);
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    signal_group(child.id(), GroupSignal::Kill);
}

#[cfg(not(unix))]
fn group_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.kill();
}
