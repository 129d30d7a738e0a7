// Process - one managed upstream inference server
//
// Owns the child process lifecycle (spawn, health check, sleep/wake, TTL
// idle-out, stop) and the reverse proxy to it. All state mutation goes
// through the swap primitive in state.rs; a dedicated supervisor task is
// the only component that transitions to Stopped when the child dies on
// its own.

use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{request, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::{
    split_command, substitute_macros, Config, EndpointConfig, ModelConfig,
};
use crate::events::EventBus;
use crate::metrics::MetricsMonitor;
use crate::process::state::{ProcessState, StateCell, SwapError};

/// Health-check poll interval while Starting/Waking
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Per-probe timeout within the health-check loop
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP connect timeout for health/sleep/wake clients
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace between SIGTERM (or cmdStop) and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while draining in-flight requests
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// TTL monitor tick
const TTL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How a stop should treat requests currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Drain: wait for the in-flight counter to reach zero first
    WaitForInflight,
    /// Kill now; in-flight requests see the upstream connection drop
    Immediate,
}

/// Errors surfaced by Process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {model}: {source}")]
    Spawn {
        model: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{model} did not become healthy within {timeout_secs}s")]
    HealthCheckTimeout { model: String, timeout_secs: u64 },

    #[error("{model} start aborted: state changed to {actual}")]
    StartAborted { model: String, actual: ProcessState },

    #[error("{model} start failed in a concurrent caller")]
    StartFailedElsewhere { model: String },

    #[error("{model} sleep endpoint failed: {reason}")]
    SleepFailed { model: String, reason: String },

    #[error("{model} wake failed: {reason}")]
    WakeFailed { model: String, reason: String },

    #[error("{model} is not available (state {state})")]
    Unavailable { model: String, state: ProcessState },

    #[error("unknown model {model}")]
    UnknownModel { model: String },

    #[error("{model} concurrency limit reached")]
    ConcurrencyRejected { model: String },

    #[error("{model} lifecycle conflict: {source}")]
    Lifecycle {
        model: String,
        #[source]
        source: SwapError,
    },

    #[error("upstream request to {model} failed: {source}")]
    Upstream {
        model: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build response for {model}: {source}")]
    ResponseBuild {
        model: String,
        #[source]
        source: axum::http::Error,
    },
}

/// Snapshot of one process for `/running`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub model: String,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub in_flight: i64,
    pub failed_starts: u32,
}

/// One managed backend: lifecycle, health, TTL, sleep/wake, reverse proxy
pub struct Process {
    model_id: String,
    config: ModelConfig,

    /// Interpolated argv for the start command
    argv: Vec<String>,
    /// Interpolated upstream base URL
    upstream: String,
    /// Port assigned to this process for its whole life
    port: u16,

    health_check_timeout: Duration,
    sleep_request_timeout: Duration,
    wake_request_timeout: Duration,
    max_capture_bytes: usize,

    state: StateCell,
    start_gate: tokio::sync::Mutex<()>,
    sleep_gate: tokio::sync::Mutex<()>,
    wake_gate: tokio::sync::Mutex<()>,

    child_pid: Mutex<Option<u32>>,

    in_flight: AtomicI64,
    last_request: Mutex<Instant>,
    failed_starts: AtomicU32,
    /// Bumped on every Ready entry; stale TTL monitors observe it and exit
    ttl_generation: AtomicU64,

    semaphore: Option<Arc<Semaphore>>,
    client: reqwest::Client,
    events: EventBus,
    metrics: Arc<MetricsMonitor>,
}

impl Process {
    pub fn new(
        model_id: &str,
        config: ModelConfig,
        globals: &Config,
        port: u16,
        events: EventBus,
        metrics: Arc<MetricsMonitor>,
    ) -> Arc<Self> {
        let mut vars = HashMap::new();
        vars.insert("PORT", port.to_string());
        vars.insert("MODEL_ID", model_id.to_string());

        let argv = split_command(&substitute_macros(&config.cmd, &vars));
        let upstream = substitute_macros(config.proxy_template(), &vars);

        let semaphore = if config.concurrency_limit > 0 {
            Some(Arc::new(Semaphore::new(config.concurrency_limit)))
        } else {
            None
        };

        // Streaming responses can outlive any sane total timeout, so the
        // proxy client only bounds connection establishment.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            model_id: model_id.to_string(),
            config,
            argv,
            upstream,
            port,
            health_check_timeout: Duration::from_secs(globals.health_check_timeout),
            sleep_request_timeout: Duration::from_secs(globals.sleep_request_timeout),
            wake_request_timeout: Duration::from_secs(globals.wake_request_timeout),
            max_capture_bytes: globals.max_capture_bytes,
            state: StateCell::new(),
            start_gate: tokio::sync::Mutex::new(()),
            sleep_gate: tokio::sync::Mutex::new(()),
            wake_gate: tokio::sync::Mutex::new(()),
            child_pid: Mutex::new(None),
            in_flight: AtomicI64::new(0),
            last_request: Mutex::new(Instant::now()),
            failed_starts: AtomicU32::new(0),
            ttl_generation: AtomicU64::new(0),
            semaphore,
            client,
            events,
            metrics,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn current_state(&self) -> ProcessState {
        self.state.current()
    }

    pub fn upstream_url(&self) -> &str {
        &self.upstream
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn sleep_configured(&self) -> bool {
        self.config.sleep_configured()
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            model: self.model_id.clone(),
            state: self.current_state(),
            pid: *self.child_pid.lock().unwrap_or_else(|e| e.into_inner()),
            in_flight: self.in_flight(),
            failed_starts: self.failed_starts.load(Ordering::SeqCst),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // State helpers
    // ─────────────────────────────────────────────────────────────────────

    fn transition(&self, from: ProcessState, to: ProcessState) -> Result<(), ProcessError> {
        self.state.swap(from, to).map_err(|source| ProcessError::Lifecycle {
            model: self.model_id.clone(),
            source,
        })?;
        self.events.state_changed(&self.model_id, from, to);
        Ok(())
    }

    /// Best-effort transition: ignores a lost race but still publishes the
    /// event when the swap lands.
    fn try_transition(&self, from: ProcessState, to: ProcessState) -> bool {
        if self.state.swap(from, to).is_ok() {
            self.events.state_changed(&self.model_id, from, to);
            true
        } else {
            false
        }
    }

    fn force_state(&self, to: ProcessState) {
        let prev = self.state.force(to);
        if prev != to && self.state.current() == to {
            self.events.state_changed(&self.model_id, prev, to);
        }
    }

    /// Wait until the state leaves transitional territory, bounded by the
    /// health-check timeout. Returns the state observed.
    async fn wait_for_settled(&self) -> Result<ProcessState, ProcessError> {
        let mut rx = self.state.subscribe();
        let result = timeout(
            self.health_check_timeout,
            rx.wait_for(|s| !s.is_transitional()),
        )
        .await;
        match result {
            Ok(Ok(state)) => Ok(*state),
            _ => Err(ProcessError::Unavailable {
                model: self.model_id.clone(),
                state: self.state.current(),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────

    /// Bring the process to Ready from Stopped, or join an in-progress start.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProcessError> {
        match self.start_gate.try_lock() {
            Ok(_guard) => self.run_start().await,
            Err(_) => {
                // Another caller is mid-start; wait on its gate, then judge
                // by the state it left behind.
                let _guard = self.start_gate.lock().await;
                if self.state.current() == ProcessState::Ready {
                    Ok(())
                } else {
                    Err(ProcessError::StartFailedElsewhere {
                        model: self.model_id.clone(),
                    })
                }
            }
        }
    }

    async fn run_start(self: &Arc<Self>) -> Result<(), ProcessError> {
        match self.state.current() {
            ProcessState::Ready => return Ok(()),
            ProcessState::Stopped => {}
            other => {
                return Err(ProcessError::Unavailable {
                    model: self.model_id.clone(),
                    state: other,
                })
            }
        }
        self.transition(ProcessState::Stopped, ProcessState::Starting)?;

        tracing::info!(
            "starting {} on port {}: {}",
            self.model_id,
            self.port,
            self.argv.join(" ")
        );

        if let Err(e) = self.spawn_child() {
            self.failed_starts.fetch_add(1, Ordering::SeqCst);
            // Roll the state back; a conflicting transition gets reported
            // alongside the spawn failure rather than swallowed.
            if !self.try_transition(ProcessState::Starting, ProcessState::Stopped) {
                tracing::error!(
                    "spawn of {} failed and rollback conflicted (state {})",
                    self.model_id,
                    self.state.current()
                );
            }
            return Err(e);
        }

        match self.health_check_loop(ProcessState::Starting).await {
            Ok(()) => {
                self.transition(ProcessState::Starting, ProcessState::Ready)?;
                self.failed_starts.store(0, Ordering::SeqCst);
                self.spawn_ttl_monitor();
                tracing::info!("{} is ready", self.model_id);
                Ok(())
            }
            Err(e) => {
                self.failed_starts.fetch_add(1, Ordering::SeqCst);
                tracing::error!("{} failed to become ready: {}", self.model_id, e);
                self.kill_child_and_wait().await;
                // The supervisor normally lands us in Stopped; cover the
                // abort path where the state never left Starting.
                self.try_transition(ProcessState::Starting, ProcessState::Stopped);
                Err(e)
            }
        }
    }

    fn spawn_child(self: &Arc<Self>) -> Result<(), ProcessError> {
        if self.argv.is_empty() {
            return Err(ProcessError::Spawn {
                model: self.model_id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        }

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for entry in &self.config.env {
            if let Some((name, value)) = entry.split_once('=') {
                cmd.env(name, value);
            }
        }
        // Own process group so stop-by-signal reaches descendants too
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            model: self.model_id.clone(),
            source,
        })?;

        let pid = child.id();
        *self.child_pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
        tracing::info!("{} spawned with pid {:?}", self.model_id, pid);

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_pump(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_pump(stderr);
        }

        // Supervisor: sole component allowed to set Stopped on unexpected
        // death. Everything else only requests stop through the swap
        // primitive.
        let proc = Arc::clone(self);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!("[{}] process exited with {}", proc.model_id, status)
                }
                Err(e) => tracing::warn!("[{}] wait for process failed: {}", proc.model_id, e),
            }
            *proc.child_pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
            proc.force_state(ProcessState::Stopped);
        });

        Ok(())
    }

    fn spawn_log_pump(self: &Arc<Self>, reader: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
        let model = self.model_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!("[{}] {}", model, line);
            }
        });
    }

    /// Poll the upstream health endpoint until 2xx, the deadline passes,
    /// or the state leaves `expected` (an external stop).
    async fn health_check_loop(&self, expected: ProcessState) -> Result<(), ProcessError> {
        let url = format!("{}{}", self.upstream, self.config.check_endpoint);
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        let deadline = Instant::now() + self.health_check_timeout;

        loop {
            let current = self.state.current();
            if current != expected {
                return Err(ProcessError::StartAborted {
                    model: self.model_id.clone(),
                    actual: current,
                });
            }
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    tracing::debug!("{} health check returned {}", self.model_id, resp.status())
                }
                Err(e) => tracing::trace!("{} health check: {}", self.model_id, e),
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::HealthCheckTimeout {
                    model: self.model_id.clone(),
                    timeout_secs: self.health_check_timeout.as_secs(),
                });
            }
            tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // TTL
    // ─────────────────────────────────────────────────────────────────────

    /// Spawn the idle monitor for this Ready interval. A new generation
    /// supersedes any previous monitor, so exactly one is ever live.
    fn spawn_ttl_monitor(self: &Arc<Self>) {
        let generation = self.ttl_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.ttl == 0 {
            return;
        }
        // Entering Ready counts as activity; otherwise a stale timestamp
        // could expire the process immediately.
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

        let ttl = Duration::from_secs(self.config.ttl);
        let proc = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TTL_CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if proc.ttl_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if proc.state.current() != ProcessState::Ready {
                    return;
                }
                if proc.in_flight.load(Ordering::SeqCst) > 0 {
                    continue;
                }
                let idle = proc
                    .last_request
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if idle >= ttl {
                    tracing::info!(
                        "{} idle for {:?} (ttl {:?}), stopping",
                        proc.model_id,
                        idle,
                        ttl
                    );
                    // TTL frees memory fully: always a stop, never a sleep
                    proc.stop(StopMode::WaitForInflight).await;
                    return;
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sleep / Wake
    // ─────────────────────────────────────────────────────────────────────

    /// Put the backend to sleep. No-op unless sleep mode is enabled with at
    /// least one endpoint. On any endpoint failure the fallback is Stop.
    pub async fn sleep(self: &Arc<Self>) -> Result<(), ProcessError> {
        if !self.config.sleep_configured() {
            return Ok(());
        }
        let _guard = self.sleep_gate.lock().await;
        match self.state.current() {
            ProcessState::Asleep => return Ok(()),
            ProcessState::Ready => {}
            other => {
                tracing::debug!("{} sleep skipped in state {}", self.model_id, other);
                return Ok(());
            }
        }

        self.drain_in_flight().await;
        self.transition(ProcessState::Ready, ProcessState::SleepPending)?;

        for endpoint in &self.config.sleep_endpoints {
            if let Err(reason) = self
                .call_endpoint(endpoint, self.sleep_request_timeout)
                .await
            {
                tracing::error!(
                    "{} sleep endpoint {} failed: {}; stopping instead",
                    self.model_id,
                    endpoint.path,
                    reason
                );
                let _ = self.transition(ProcessState::SleepPending, ProcessState::Stopping);
                self.kill_child_and_wait().await;
                self.force_state(ProcessState::Stopped);
                return Err(ProcessError::SleepFailed {
                    model: self.model_id.clone(),
                    reason,
                });
            }
        }

        self.transition(ProcessState::SleepPending, ProcessState::Asleep)?;
        tracing::info!("{} is asleep", self.model_id);
        Ok(())
    }

    /// Wake a sleeping backend. Fail-fast: any wake-endpoint or post-wake
    /// health failure kills the child and lands in Stopped; recovery is the
    /// caller's decision (normally a fresh Start on the next request).
    pub async fn wake(self: &Arc<Self>) -> Result<(), ProcessError> {
        let _guard = self.wake_gate.lock().await;
        loop {
            match self.state.current() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Asleep => break,
                ProcessState::SleepPending => {
                    // A sleep is mid-flight; wait for it to settle, then
                    // wake from wherever it landed.
                    let mut rx = self.state.subscribe();
                    if timeout(
                        self.health_check_timeout,
                        rx.wait_for(|s| *s != ProcessState::SleepPending),
                    )
                    .await
                    .is_err()
                    {
                        return Err(ProcessError::WakeFailed {
                            model: self.model_id.clone(),
                            reason: "timed out waiting for in-progress sleep".into(),
                        });
                    }
                }
                other => {
                    return Err(ProcessError::Unavailable {
                        model: self.model_id.clone(),
                        state: other,
                    })
                }
            }
        }

        self.transition(ProcessState::Asleep, ProcessState::Waking)?;

        for endpoint in &self.config.wake_endpoints {
            if let Err(reason) = self
                .call_endpoint(endpoint, self.wake_request_timeout)
                .await
            {
                return self.fail_wake(reason).await;
            }
        }

        if let Err(e) = self.health_check_loop(ProcessState::Waking).await {
            return self.fail_wake(e.to_string()).await;
        }

        self.transition(ProcessState::Waking, ProcessState::Ready)?;
        self.spawn_ttl_monitor();
        tracing::info!("{} is awake", self.model_id);
        Ok(())
    }

    async fn fail_wake(&self, reason: String) -> Result<(), ProcessError> {
        tracing::error!("{} wake failed: {}; killing process", self.model_id, reason);
        self.kill_child_and_wait().await;
        self.force_state(ProcessState::Stopped);
        Err(ProcessError::WakeFailed {
            model: self.model_id.clone(),
            reason,
        })
    }

    /// Sleep if configured, otherwise stop. Used by group displacement.
    pub async fn make_idle(self: &Arc<Self>) {
        if self.config.sleep_configured() {
            // On failure sleep() already fell back to stop
            let _ = self.sleep().await;
        } else {
            self.stop(StopMode::WaitForInflight).await;
        }
    }

    async fn call_endpoint(
        &self,
        endpoint: &EndpointConfig,
        default_timeout: Duration,
    ) -> Result<(), String> {
        let request_timeout = endpoint
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| e.to_string())?;

        let method = reqwest::Method::from_bytes(endpoint.method.as_bytes())
            .map_err(|e| format!("invalid method {:?}: {}", endpoint.method, e))?;
        let url = format!("{}{}", self.upstream, endpoint.path);

        let mut req = client.request(method, &url);
        if let Some(body) = &endpoint.body {
            req = req
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let resp = req.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("{} returned {}", endpoint.path, resp.status()));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────

    /// Stop the process. Idempotent; concurrent callers converge on the
    /// same terminal Stopped state.
    pub async fn stop(self: &Arc<Self>, mode: StopMode) {
        if mode == StopMode::WaitForInflight {
            self.drain_in_flight().await;
        }

        loop {
            let current = self.state.current();
            let target = match current {
                ProcessState::Stopped | ProcessState::Shutdown => return,
                ProcessState::Stopping => {
                    self.await_stopped().await;
                    return;
                }
                // Starting has no edge to Stopping; yank it straight to
                // Stopped (the health loop aborts when it observes this)
                // and kill the half-started child below.
                ProcessState::Starting => ProcessState::Stopped,
                _ => ProcessState::Stopping,
            };
            if self.transition(current, target).is_ok() {
                break;
            }
            // Lost a race; re-read and try again
        }

        self.kill_child_and_wait().await;
        // The supervisor lands the state in Stopped when the child exits;
        // cover the no-child case and the race where it has not yet run.
        self.try_transition(ProcessState::Stopping, ProcessState::Stopped);
    }

    /// Stop (if needed) and park in the terminal Shutdown state.
    pub async fn shutdown(self: &Arc<Self>) {
        self.stop(StopMode::Immediate).await;
        self.try_transition(ProcessState::Stopped, ProcessState::Shutdown);
    }

    async fn await_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = timeout(
            STOP_GRACE * 3,
            rx.wait_for(|s| matches!(s, ProcessState::Stopped | ProcessState::Shutdown)),
        )
        .await;
    }

    async fn drain_in_flight(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Terminate the child: custom cmdStop or SIGTERM to its process
    /// group, then SIGKILL after the grace period. Waits for the
    /// supervisor to observe the exit.
    async fn kill_child_and_wait(&self) {
        let pid = *self.child_pid.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pid) = pid else { return };

        if self.config.cmd_stop.trim().is_empty() {
            signal_group(pid, SIGTERM);
        } else {
            self.run_stop_command(pid).await;
        }

        if !self.wait_child_exit(STOP_GRACE).await {
            tracing::warn!(
                "{} (pid {}) did not exit within {:?}; sending SIGKILL",
                self.model_id,
                pid,
                STOP_GRACE
            );
            signal_group(pid, SIGKILL);
            self.wait_child_exit(STOP_GRACE).await;
        }
    }

    async fn run_stop_command(&self, pid: u32) {
        let mut vars = HashMap::new();
        vars.insert("PID", pid.to_string());
        let argv = split_command(&substitute_macros(&self.config.cmd_stop, &vars));
        if argv.is_empty() {
            signal_group(pid, SIGTERM);
            return;
        }
        tracing::info!("{} running stop command: {}", self.model_id, argv.join(" "));
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        match timeout(STOP_GRACE, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                tracing::warn!("{} stop command exited with {}", self.model_id, status)
            }
            Ok(Err(e)) => tracing::warn!("{} stop command failed: {}", self.model_id, e),
            Err(_) => tracing::warn!("{} stop command timed out", self.model_id),
        }
    }

    async fn wait_child_exit(&self, grace: Duration) -> bool {
        timeout(grace, async {
            loop {
                if self
                    .child_pid
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_none()
                {
                    return;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Request proxying
    // ─────────────────────────────────────────────────────────────────────

    /// Make the process Ready: start it, wake it, or wait out a concurrent
    /// transition, per the start protocol.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<(), ProcessError> {
        loop {
            match self.state.current() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Stopped => self.start().await?,
                ProcessState::Asleep | ProcessState::SleepPending => self.wake().await?,
                ProcessState::Starting | ProcessState::Waking => {
                    let settled = self.wait_for_settled().await?;
                    if settled != ProcessState::Ready {
                        return Err(ProcessError::Unavailable {
                            model: self.model_id.clone(),
                            state: settled,
                        });
                    }
                }
                state @ (ProcessState::Stopping | ProcessState::Shutdown) => {
                    return Err(ProcessError::Unavailable {
                        model: self.model_id.clone(),
                        state,
                    })
                }
            }
        }
    }

    /// Proxy one buffered request to the upstream, streaming the response
    /// back with a bounded tee for metrics.
    pub async fn proxy_request(
        self: &Arc<Self>,
        parts: request::Parts,
        body: Bytes,
    ) -> Result<Response<Body>, ProcessError> {
        self.ensure_ready().await?;

        let permit = match &self.semaphore {
            Some(sem) => {
                match timeout(self.health_check_timeout, Arc::clone(sem).acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    _ => {
                        return Err(ProcessError::ConcurrencyRejected {
                            model: self.model_id.clone(),
                        })
                    }
                }
            }
            None => None,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard {
            proc: Arc::clone(self),
            _permit: permit,
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.upstream, path_and_query);

        let mut upstream_req = self
            .client
            .request(parts.method.clone(), &url)
            .body(reqwest::Body::from(body));
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }

        let start = Instant::now();
        let upstream_resp = upstream_req
            .send()
            .await
            .map_err(|source| ProcessError::Upstream {
                model: self.model_id.clone(),
                source,
            })?;

        let status = upstream_resp.status();
        let headers = upstream_resp.headers().clone();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut builder = Response::builder().status(status);
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if content_type.contains("text/event-stream") {
            // Defeat buffering in intermediate proxies for SSE
            builder = builder.header("X-Accel-Buffering", "no");
        }

        let tee = TeeBody::new(
            upstream_resp.bytes_stream().boxed(),
            self.max_capture_bytes,
            TeeFinish {
                monitor: Arc::clone(&self.metrics),
                model: self.model_id.clone(),
                status: status.as_u16(),
                content_type,
                start,
                _guard: guard,
            },
        );

        builder
            .body(Body::from_stream(tee))
            .map_err(|source| ProcessError::ResponseBuild {
                model: self.model_id.clone(),
                source,
            })
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::HOST
        || name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::CONTENT_LENGTH
        || name == header::UPGRADE
        || name.as_str() == "keep-alive"
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // Negative pid targets the whole process group
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: i32) {}

// ─────────────────────────────────────────────────────────────────────────────
// In-flight tracking and the tee stream
// ─────────────────────────────────────────────────────────────────────────────

/// Decrements the in-flight counter and stamps lastRequestHandled on every
/// exit path, including client cancellation.
struct InflightGuard {
    proc: Arc<Process>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        *self
            .proc
            .last_request
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.proc.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct TeeFinish {
    monitor: Arc<MetricsMonitor>,
    model: String,
    status: u16,
    content_type: String,
    start: Instant,
    _guard: InflightGuard,
}

/// Forwards every chunk unchanged while copying up to `cap` bytes aside;
/// when the stream ends cleanly the captured bytes feed the metrics
/// monitor. Dropped mid-stream (client cancel) it only releases the
/// in-flight guard.
struct TeeBody {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    captured: BytesMut,
    cap: usize,
    first_byte: Option<Instant>,
    errored: bool,
    finish: Option<TeeFinish>,
}

impl TeeBody {
    fn new(
        inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
        cap: usize,
        finish: TeeFinish,
    ) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            cap,
            first_byte: None,
            errored: false,
            finish: Some(finish),
        }
    }

    fn finalize(&mut self, complete: bool) {
        let Some(finish) = self.finish.take() else {
            return;
        };
        if !complete || self.errored {
            return; // guard drops; no metric for cancelled/failed streams
        }
        let duration_ms = finish.start.elapsed().as_millis() as i64;
        if let Some(first_byte) = self.first_byte {
            tracing::debug!(
                "{} response complete: ttfb {:?}, total {}ms",
                finish.model,
                first_byte.duration_since(finish.start),
                duration_ms
            );
        }
        let body = self.captured.split().freeze();
        finish.monitor.observe_response(
            &finish.model,
            finish.status,
            &finish.content_type,
            &body,
            duration_ms,
        );
    }
}

impl Stream for TeeBody {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if this.first_byte.is_none() {
                    this.first_byte = Some(Instant::now());
                }
                let room = this.cap.saturating_sub(this.captured.len());
                if room > 0 {
                    let take = room.min(chunk.len());
                    this.captured.extend_from_slice(&chunk[..take]);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.errored = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        self.finalize(false);
    }
}

impl ProcessStatus {
    /// Whether this process counts as active for `/running`
    pub fn is_active(&self) -> bool {
        !matches!(self.state, ProcessState::Stopped | ProcessState::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_process(yaml: &str, model: &str) -> Arc<Process> {
        let config = Config::from_yaml(yaml).unwrap();
        let model_config = config.models[model].clone();
        let bus = EventBus::new();
        let metrics = Arc::new(MetricsMonitor::new(10, bus.clone()));
        Process::new(model, model_config, &config, 5900, bus, metrics)
    }

    #[test]
    fn construction_interpolates_port_and_model_id() {
        let process = build_process(
            r#"
models:
  m:
    cmd: "srv --port ${PORT} --name ${MODEL_ID}"
"#,
            "m",
        );
        assert_eq!(process.argv, vec!["srv", "--port", "5900", "--name", "m"]);
        assert_eq!(process.upstream_url(), "http://localhost:5900");
        assert_eq!(process.current_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_reports_and_returns_to_stopped() {
        let process = build_process(
            "models:\n  m:\n    cmd: \"/nonexistent-binary-for-llmsnap-tests\"\n",
            "m",
        );
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(process.current_state(), ProcessState::Stopped);
        assert_eq!(process.status().failed_starts, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_from_stopped() {
        let process = build_process("models:\n  m:\n    cmd: \"sleep 30\"\n", "m");
        process.stop(StopMode::Immediate).await;
        process.stop(StopMode::WaitForInflight).await;
        assert_eq!(process.current_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn sleep_is_a_noop_without_sleep_mode() {
        let process = build_process("models:\n  m:\n    cmd: \"sleep 30\"\n", "m");
        assert!(!process.sleep_configured());
        process.sleep().await.unwrap();
        assert_eq!(process.current_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn wake_from_stopped_is_rejected() {
        let process = build_process(
            r#"
models:
  m:
    cmd: "sleep 30"
    sleepMode: enable
    sleepEndpoints:
      - path: /sleep
    wakeEndpoints:
      - path: /wake
"#,
            "m",
        );
        let err = process.wake().await.unwrap_err();
        assert!(matches!(err, ProcessError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let process = build_process("models:\n  m:\n    cmd: \"sleep 30\"\n", "m");
        process.shutdown().await;
        assert_eq!(process.current_state(), ProcessState::Shutdown);
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Unavailable { .. }));
    }

    #[test]
    fn hop_by_hop_headers_are_skipped() {
        assert!(is_hop_by_hop(&header::HOST));
        assert!(is_hop_by_hop(&header::CONNECTION));
        assert!(is_hop_by_hop(&header::CONTENT_LENGTH));
        assert!(!is_hop_by_hop(&header::CONTENT_TYPE));
        assert!(!is_hop_by_hop(&header::AUTHORIZATION));
    }
}
