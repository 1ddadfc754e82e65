//! One long-lived console shell per tenant, used as the carrier that launches,
//! observes and terminates the game server.
//!
//! Run state is never stored as truth: it is re-derived from the liveness
//! oracle on every chunk of console output (and on an optional slow timer).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ingot_process::{RunState, SessionEvent, SessionStatus, TenantId};
use tokio::{
    sync::{Mutex, broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    broadcast::SessionBroadcastHub,
    config::AgentConfig,
    error::EngineError,
    liveness::LivenessOracle,
    pty_shell::{ShellHandle, ShellLauncher, launch_line},
    startup::{StartupCommand, StartupView},
    transcript::{Transcript, read_tail},
};

const HISTORY_LIMIT_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub log_max_lines: usize,
    pub log_max_bytes: u64,
    pub start_grace: Duration,
    pub liveness_interval: Option<Duration>,
    pub stop_command: String,
}

impl From<&AgentConfig> for SupervisorSettings {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            log_max_lines: cfg.log_max_lines,
            log_max_bytes: cfg.log_max_bytes,
            start_grace: cfg.start_grace,
            liveness_interval: cfg.liveness_interval,
            stop_command: cfg.stop_command.clone(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

/// Everything needed to open a managed session for one tenant.
pub struct SessionConfig {
    pub tenant_id: TenantId,
    /// Working directory of the console shell (the tenant sandbox root).
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub sentinel_path: PathBuf,
    pub startup: StartupCommand,
    pub oracle: Arc<dyn LivenessOracle>,
}

struct SessionEntry {
    shell: Box<dyn ShellHandle>,
    shell_alive: bool,
    oracle: Arc<dyn LivenessOracle>,
    sentinel_path: PathBuf,
    log_path: PathBuf,
    startup: StartupCommand,
    state: RunState,
    observed_pid: Option<u32>,
    start_requested_at: Option<Instant>,
    message: Option<String>,
    pump: Option<JoinHandle<()>>,
}

impl SessionEntry {
    fn status(&self, tenant: &TenantId) -> SessionStatus {
        SessionStatus {
            tenant_id: tenant.clone(),
            state: self.state,
            pid: self.observed_pid,
            effective_command: self.startup.effective(),
            message: self.message.clone(),
        }
    }

    /// Returns `Some(false)` when this is a transition into Stopped.
    fn mark_stopped(&mut self) -> Option<bool> {
        let was = self.state;
        self.state = RunState::Stopped;
        self.observed_pid = None;
        self.start_requested_at = None;
        self.oracle.clear_sentinel();
        (was != RunState::Stopped).then_some(false)
    }

    /// Re-derive the run state. Returns the status edge to publish, if any.
    fn evaluate(&mut self, grace: Duration, now: Instant) -> Option<bool> {
        let sentinel = self.oracle.sentinel_pid();
        if sentinel.is_some() {
            self.observed_pid = sentinel;
        }
        // A graceful stop removes the sentinel; keep watching the PID we already know.
        let candidate = match (sentinel, self.state) {
            (Some(pid), _) => Some(pid),
            (None, RunState::Stopping) => self.observed_pid,
            (None, _) => None,
        };

        match candidate {
            Some(pid) if self.oracle.is_alive(pid) => match self.state {
                RunState::Running | RunState::Stopping => None,
                RunState::Stopped | RunState::Starting => {
                    self.state = RunState::Running;
                    self.start_requested_at = None;
                    self.message = None;
                    Some(true)
                }
            },
            Some(_) => self.mark_stopped(),
            None => match self.state {
                RunState::Stopped => None,
                RunState::Starting
                    if self
                        .start_requested_at
                        .is_some_and(|at| now.duration_since(at) < grace) =>
                {
                    None
                }
                RunState::Starting => {
                    self.message = Some("server did not report a pid".to_string());
                    self.mark_stopped()
                }
                RunState::Running | RunState::Stopping => self.mark_stopped(),
            },
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), EngineError> {
        if !self.shell_alive {
            return Err(EngineError::SessionIo("console shell has exited".to_string()));
        }
        let mut data = line.to_string();
        if !data.ends_with('\n') {
            data.push('\n');
        }
        self.shell.write(data.as_bytes())
    }
}

enum PumpInput {
    Output(Vec<u8>),
    Tick,
    Closed,
}

async fn next_input(
    rx: &mut mpsc::Receiver<Vec<u8>>,
    ticker: &mut Option<tokio::time::Interval>,
) -> PumpInput {
    match ticker {
        Some(t) => tokio::select! {
            chunk = rx.recv() => chunk.map_or(PumpInput::Closed, PumpInput::Output),
            _ = t.tick() => PumpInput::Tick,
        },
        None => rx.recv().await.map_or(PumpInput::Closed, PumpInput::Output),
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Mutex<HashMap<TenantId, SessionEntry>>>,
    hub: SessionBroadcastHub,
    launcher: Arc<dyn ShellLauncher>,
    settings: Arc<SupervisorSettings>,
}

impl ProcessSupervisor {
    pub fn new(
        hub: SessionBroadcastHub,
        launcher: Arc<dyn ShellLauncher>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            hub,
            launcher,
            settings: Arc::new(settings),
        }
    }

    pub fn hub(&self) -> &SessionBroadcastHub {
        &self.hub
    }

    /// Spawn the console shell for a tenant. Fails if the shell cannot be started.
    pub async fn create_session(&self, cfg: SessionConfig) -> Result<SessionStatus, EngineError> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(&cfg.tenant_id) {
            return Err(EngineError::SessionExists(cfg.tenant_id.to_string()));
        }

        // Whatever a previous agent run left behind describes a process we no longer own.
        cfg.oracle.clear_sentinel();

        let transcript = Transcript::open(
            cfg.log_path.clone(),
            self.settings.log_max_lines,
            self.settings.log_max_bytes,
        )
        .await
        .map_err(|e| {
            EngineError::SpawnFailure(format!("open transcript {}: {e}", cfg.log_path.display()))
        })?;

        let (shell, rx) = self.launcher.spawn(&cfg.cwd)?;
        let shell_pid = shell.pid();

        let tenant = cfg.tenant_id.clone();
        let mut entry = SessionEntry {
            shell,
            shell_alive: true,
            oracle: cfg.oracle,
            sentinel_path: cfg.sentinel_path,
            log_path: cfg.log_path,
            startup: cfg.startup,
            state: RunState::Stopped,
            observed_pid: None,
            start_requested_at: None,
            message: None,
            pump: None,
        };
        entry.pump = Some(self.spawn_pump(tenant.clone(), rx, transcript));
        let status = entry.status(&tenant);
        inner.insert(tenant.clone(), entry);

        tracing::info!(tenant_id = %tenant, cwd = %cfg.cwd.display(), shell_pid = ?shell_pid, "session created");
        Ok(status)
    }

    fn spawn_pump(
        &self,
        tenant: TenantId,
        mut rx: mpsc::Receiver<Vec<u8>>,
        mut transcript: Transcript,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = this.settings.liveness_interval.map(|d| {
                let mut t = tokio::time::interval(d);
                t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                t
            });

            loop {
                match next_input(&mut rx, &mut ticker).await {
                    PumpInput::Output(chunk) => {
                        this.hub
                            .publish(&tenant, SessionEvent::Output(chunk.clone()))
                            .await;
                        if let Err(e) = transcript.append(&chunk).await {
                            tracing::warn!(
                                tenant_id = %tenant,
                                path = %transcript.path().display(),
                                error = %e,
                                "failed to write transcript"
                            );
                        }
                        this.refresh_inner(&tenant).await;
                    }
                    PumpInput::Tick => {
                        this.refresh_inner(&tenant).await;
                    }
                    PumpInput::Closed => {
                        this.on_shell_exit(&tenant).await;
                        break;
                    }
                }
            }
        })
    }

    async fn refresh_inner(&self, tenant: &TenantId) -> Option<SessionStatus> {
        let mut inner = self.inner.lock().await;
        let e = inner.get_mut(tenant)?;
        let before = e.state;
        // Published under the registry lock so status edges keep their order.
        if let Some(edge) = e.evaluate(self.settings.start_grace, Instant::now()) {
            tracing::info!(tenant_id = %tenant, from = ?before, to = ?e.state, pid = ?e.observed_pid, "server state changed");
            self.hub.publish(tenant, SessionEvent::Status(edge)).await;
        }
        Some(e.status(tenant))
    }

    async fn on_shell_exit(&self, tenant: &TenantId) {
        let mut inner = self.inner.lock().await;
        let Some(e) = inner.get_mut(tenant) else {
            return;
        };
        tracing::warn!(tenant_id = %tenant, "console shell exited");
        e.shell_alive = false;
        e.message = Some("console shell exited".to_string());
        if e.mark_stopped().is_some() {
            self.hub.publish(tenant, SessionEvent::Status(false)).await;
        }
    }

    /// Probe liveness now instead of waiting for the next output chunk.
    pub async fn refresh(&self, tenant: &TenantId) -> Result<SessionStatus, EngineError> {
        self.refresh_inner(tenant)
            .await
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))
    }

    pub async fn start_server(&self, tenant: &TenantId) -> Result<SessionStatus, EngineError> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(tenant)
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;

        if let Some(edge) = e.evaluate(self.settings.start_grace, Instant::now()) {
            self.hub.publish(tenant, SessionEvent::Status(edge)).await;
        }
        if e.state != RunState::Stopped {
            return Err(EngineError::AlreadyRunning);
        }

        e.oracle.clear_sentinel();
        let command = e.startup.effective();
        let line = launch_line(&command, &e.sentinel_path);
        e.write_line(&line)?;
        e.state = RunState::Starting;
        e.start_requested_at = Some(Instant::now());
        e.message = None;

        tracing::info!(tenant_id = %tenant, command = %command, "start requested");
        Ok(e.status(tenant))
    }

    /// Fire-and-forget console input. Output shows up on the broadcast channel.
    pub async fn send_command(&self, tenant: &TenantId, text: &str) -> Result<(), EngineError> {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.contains(['\r', '\n']) {
            return Err(EngineError::InvalidArgument(
                "command must be a single line".to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(tenant)
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;
        if e.state != RunState::Running {
            return Err(EngineError::NotRunning);
        }
        e.write_line(text)
    }

    /// Ask the game server to shut down on its own. Never force-kills.
    pub async fn stop_server(&self, tenant: &TenantId) -> Result<SessionStatus, EngineError> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(tenant)
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;
        if e.state != RunState::Running {
            return Err(EngineError::NotRunning);
        }

        let stop = self.settings.stop_command.clone();
        e.write_line(&stop)?;
        e.state = RunState::Stopping;
        e.message = Some("stopping".to_string());
        e.oracle.clear_sentinel();

        tracing::info!(tenant_id = %tenant, pid = ?e.observed_pid, "stop requested");
        Ok(e.status(tenant))
    }

    /// SIGKILL the observed server process tree and mark the session stopped
    /// without waiting for the probe to notice.
    pub async fn kill_server(&self, tenant: &TenantId) -> Result<SessionStatus, EngineError> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(tenant)
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;

        let Some(pid) = e.observed_pid.or_else(|| e.oracle.sentinel_pid()) else {
            return Err(EngineError::NotRunning);
        };

        tracing::warn!(tenant_id = %tenant, pid, "kill requested");
        e.oracle
            .kill_tree(pid)
            .map_err(|err| EngineError::Internal(anyhow::anyhow!("kill pid {pid}: {err}")))?;

        e.mark_stopped();
        e.message = Some("killed".to_string());
        self.hub.publish(tenant, SessionEvent::Status(false)).await;
        Ok(e.status(tenant))
    }

    /// Replace the launch configuration used by the next start.
    pub async fn update_startup_config(
        &self,
        tenant: &TenantId,
        base_command: &str,
        flags: &str,
    ) -> Result<StartupView, EngineError> {
        let startup = StartupCommand::new(base_command, flags)?;
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(tenant)
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;
        e.startup = startup;
        tracing::info!(tenant_id = %tenant, command = %e.startup.effective(), "startup config updated");
        Ok(StartupView::from(&e.startup))
    }

    pub async fn startup_view(&self, tenant: &TenantId) -> Result<StartupView, EngineError> {
        let inner = self.inner.lock().await;
        inner
            .get(tenant)
            .map(|e| StartupView::from(&e.startup))
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))
    }

    pub async fn status(&self, tenant: &TenantId) -> Option<SessionStatus> {
        let inner = self.inner.lock().await;
        inner.get(tenant).map(|e| e.status(tenant))
    }

    pub async fn list(&self) -> Vec<SessionStatus> {
        let inner = self.inner.lock().await;
        let mut out: Vec<_> = inner.iter().map(|(id, e)| e.status(id)).collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }

    pub async fn contains(&self, tenant: &TenantId) -> bool {
        self.inner.lock().await.contains_key(tenant)
    }

    /// Subscribe to a session's live output and status changes.
    pub async fn subscribe(
        &self,
        tenant: &TenantId,
    ) -> Result<broadcast::Receiver<SessionEvent>, EngineError> {
        if !self.contains(tenant).await {
            return Err(EngineError::UnknownSession(tenant.to_string()));
        }
        Ok(self.hub.subscribe(tenant).await)
    }

    /// Tail of the on-disk transcript, for viewers that just joined.
    pub async fn history(&self, tenant: &TenantId, max_lines: usize) -> Result<Vec<u8>, EngineError> {
        let path: PathBuf = {
            let inner = self.inner.lock().await;
            inner
                .get(tenant)
                .map(|e| e.log_path.clone())
                .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?
        };
        read_history(&path, max_lines).await
    }

    /// Tear a session down: kill any live server, end the shell, close the room.
    pub async fn remove_session(&self, tenant: &TenantId) -> Result<(), EngineError> {
        let Some(mut e) = self.inner.lock().await.remove(tenant) else {
            return Err(EngineError::UnknownSession(tenant.to_string()));
        };

        if let Some(pid) = e.observed_pid.or_else(|| e.oracle.sentinel_pid()) {
            if let Err(err) = e.oracle.kill_tree(pid) {
                tracing::warn!(tenant_id = %tenant, pid, error = %err, "failed to kill server during teardown");
            }
        }
        if e.mark_stopped().is_some() {
            self.hub.publish(tenant, SessionEvent::Status(false)).await;
        }
        e.shell.terminate();
        if let Some(pump) = e.pump.take() {
            pump.abort();
        }
        self.hub.close_room(tenant).await;

        tracing::info!(tenant_id = %tenant, "session removed");
        Ok(())
    }
}

async fn read_history(path: &Path, max_lines: usize) -> Result<Vec<u8>, EngineError> {
    read_tail(path, max_lines, HISTORY_LIMIT_BYTES)
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("read transcript: {e}")))
}
