//! Lifecycle of one logical unit: a flow, or the inspector.
//!
//! ```text
//! Stopped ──start──► Starting ──ok──► Running ──stop──► Stopping ──► Stopped
//!                       │                │
//!                       └──fail──► Stopped └──self-exit──► Exited ──► Stopped
//! ```
//!
//! Every transition runs under one async lock, so at most one start or stop
//! is in flight per unit. A stop arriving while a start is probing its helper
//! cancels the probe through the pending [`CancellationToken`]; the start then
//! tears down whatever it had spawned.

use crate::bus::EventBus;
use crate::launch::{LaunchPlan, Upstream};
use crate::logs::LogTail;
use crate::ports::{PortAllocator, PortLease};
use crate::probe::{ProbeOutcome, ProbeTarget, ReadinessProbe};
use chrono::{DateTime, Utc};
use mcp_studio_core::{
    CommandSpec, Event, EventPayload, ExitInfo, ExitWatch, LineSink, LogOrigin, OutputLine,
    ProcessId, ProcessManager, StopOutcome, StudioConfig, StudioError, Subject, observe_exit,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on publishing a stage's buffered output after it ended
const FORWARDER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Transient: the process went away on its own and siblings are being torn down
    Exited,
}

impl Phase {
    /// Phases in which another start is refused
    pub fn is_live(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Running)
    }
}

/// Point-in-time view of a unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
    pub phase: Phase,
    pub pid: Option<u32>,
    /// Helper port for two-stage units, otherwise the exposed port
    pub port: Option<u16>,
    pub exposed_port: Option<u16>,
    pub helper_pid: Option<u32>,
    pub last_exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub command: Option<String>,
}

impl UnitState {
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    fn reset(&mut self, phase: Phase) {
        *self = UnitState {
            phase,
            last_exit_code: self.last_exit_code,
            ..Default::default()
        };
    }
}

/// Shared collaborators of every supervisor
#[derive(Clone)]
pub struct UnitRuntime {
    pub manager: Arc<dyn ProcessManager>,
    pub bus: EventBus,
    pub ports: PortAllocator,
    pub probe: Arc<dyn ReadinessProbe>,
    pub config: Arc<StudioConfig>,
}

/// One spawned process of a unit
struct Stage {
    origin: LogOrigin,
    pid: ProcessId,
    command: String,
    port: Option<u16>,
    exit: ExitWatch,
    lines: Option<mpsc::Receiver<OutputLine>>,
    forwarder: Option<JoinHandle<()>>,
    _lease: Option<PortLease>,
}

/// Processes of a unit that reached `Running`
struct LiveUnit {
    plan: Arc<dyn LaunchPlan>,
    stages: Vec<Stage>,
}

struct Inner {
    subject: Subject,
    runtime: UnitRuntime,
    /// Held for the whole of every transition
    transition: tokio::sync::Mutex<Option<LiveUnit>>,
    state: Mutex<UnitState>,
    pending: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    tail: Arc<LogTail>,
}

/// Start/stop state machine for one unit
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(subject: Subject, runtime: UnitRuntime) -> Self {
        let tail = Arc::new(LogTail::new(runtime.config.log_tail_lines));
        Self {
            inner: Arc::new(Inner {
                subject,
                runtime,
                transition: tokio::sync::Mutex::new(None),
                state: Mutex::new(UnitState::default()),
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                tail,
            }),
        }
    }

    pub fn subject(&self) -> &Subject {
        &self.inner.subject
    }

    pub fn state(&self) -> UnitState {
        self.inner.state().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.tail.snapshot()
    }

    /// Bring the unit up; fails with `AlreadyRunning` while starting or running
    pub async fn start(&self, plan: Arc<dyn LaunchPlan>) -> Result<UnitState, StudioError> {
        self.inner.start(plan).await
    }

    /// Bring the unit down; a no-op when already stopped
    pub async fn stop(&self) -> Result<UnitState, StudioError> {
        self.inner.stop().await
    }

    /// Stop followed by start; not atomic
    pub async fn restart(&self, plan: Arc<dyn LaunchPlan>) -> Result<UnitState, StudioError> {
        self.stop().await?;
        self.start(plan).await
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, payload: EventPayload) {
        self.runtime
            .bus
            .publish(Event::new(self.subject.clone(), payload));
    }

    fn already_running(&self) -> StudioError {
        StudioError::AlreadyRunning(self.subject.to_string())
    }

    async fn start(self: &Arc<Self>, plan: Arc<dyn LaunchPlan>) -> Result<UnitState, StudioError> {
        if self.state().phase.is_live() {
            return Err(self.already_running());
        }
        let mut live = self.transition.lock().await;
        {
            let mut state = self.state();
            if state.phase.is_live() || live.is_some() {
                return Err(self.already_running());
            }
            state.reset(Phase::Starting);
        }

        let cancel = CancellationToken::new();
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = Some(cancel.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.tail.clear();
        info!(unit = %self.subject, plan = %plan.label(), "Starting unit");

        let mut stages = Vec::new();
        let outcome = self.launch(&plan, generation, &cancel, &mut stages).await;
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = None;

        match outcome {
            Ok(()) => {
                let snapshot = self.mark_running(&stages);
                let helper_pid = snapshot.helper_pid;
                self.publish(EventPayload::Started {
                    pid: snapshot.pid.unwrap_or_default(),
                    port: snapshot.port,
                    helper_pid,
                    command: snapshot.command.clone().unwrap_or_default(),
                });
                for stage in &mut stages {
                    self.start_forwarder(stage, &plan);
                }
                info!(unit = %self.subject, pid = ?snapshot.pid, port = ?snapshot.port, "Unit running");
                *live = Some(LiveUnit { plan, stages });
                Ok(snapshot)
            }
            Err(error) => {
                warn!(unit = %self.subject, "Start failed: {error}");
                self.teardown(&mut stages, &plan).await;
                self.state().reset(Phase::Stopped);
                match &error {
                    StudioError::Cancelled => self.publish(EventPayload::Stopped { exit_code: None }),
                    other => self.publish(EventPayload::failed(other)),
                }
                Err(error)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        plan: &Arc<dyn LaunchPlan>,
        generation: u64,
        cancel: &CancellationToken,
        stages: &mut Vec<Stage>,
    ) -> Result<(), StudioError> {
        let mut upstream: Option<Upstream> = None;

        if let Some(helper) = plan.helper() {
            let lease = self
                .runtime
                .ports
                .allocate()
                .map_err(|e| StudioError::Spawn(format!("no free port for helper: {e}")))?;
            let port = lease.port();
            let spec = helper.command(port);
            let stage = self
                .spawn_stage(LogOrigin::Helper, &spec, Some(lease), generation)
                .await?;
            let mut helper_exit = stage.exit.clone();
            stages.push(stage);

            let probe_config = &self.runtime.config.helper_probe;
            let target = ProbeTarget::local(port, probe_config.strategy.clone());
            tokio::select! {
                outcome = self.runtime.probe.wait_ready(&target, probe_config, cancel) => match outcome {
                    ProbeOutcome::Ready => {}
                    ProbeOutcome::TimedOut => {
                        return Err(StudioError::ReadinessTimeout {
                            target: target.to_string(),
                            timeout_ms: probe_config.timeout_ms,
                        });
                    }
                    ProbeOutcome::Cancelled => return Err(StudioError::Cancelled),
                },
                info = helper_exit.exited() => {
                    return Err(StudioError::Spawn(format!(
                        "helper exited before becoming ready (code {:?}, signal {:?})",
                        info.code, info.signal
                    )));
                }
            }
            upstream = Some(helper.upstream(port));
        }

        if cancel.is_cancelled() {
            return Err(StudioError::Cancelled);
        }
        let spec = plan.exposed(upstream.as_ref()).await?;
        let stage = self
            .spawn_stage(LogOrigin::Exposed, &spec, None, generation)
            .await?;
        stages.push(stage);

        if cancel.is_cancelled() {
            return Err(StudioError::Cancelled);
        }
        Ok(())
    }

    async fn spawn_stage(
        self: &Arc<Self>,
        origin: LogOrigin,
        spec: &CommandSpec,
        lease: Option<PortLease>,
        generation: u64,
    ) -> Result<Stage, StudioError> {
        let (sink, lines) = LineSink::channel(self.runtime.config.line_buffer);
        let mut handle = self
            .runtime
            .manager
            .spawn_process(spec, sink)
            .await
            .map_err(|e| StudioError::Spawn(format!("{e:#}")))?;
        let Some(pid) = handle.get_pid() else {
            let _ = handle.kill().await;
            return Err(StudioError::Spawn(format!(
                "'{}' has no process id",
                spec.program
            )));
        };
        debug!(unit = %self.subject, ?origin, %pid, "Stage spawned");

        let (exit, _observer) = observe_exit(handle);
        self.watch_exit(generation, origin, pid, exit.clone());

        Ok(Stage {
            origin,
            pid,
            command: spec.display(),
            port: spec.port,
            exit,
            lines: Some(lines),
            forwarder: None,
            _lease: lease,
        })
    }

    /// Report the stage's exit if it happens while the same run is `Running`
    fn watch_exit(self: &Arc<Self>, generation: u64, origin: LogOrigin, pid: ProcessId, mut exit: ExitWatch) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let info = exit.exited().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_unsolicited_exit(generation, origin, pid, info).await;
            }
        });
    }

    fn start_forwarder(&self, stage: &mut Stage, plan: &Arc<dyn LaunchPlan>) {
        let Some(mut lines) = stage.lines.take() else {
            return;
        };
        let origin = stage.origin;
        let plan = plan.clone();
        let subject = self.subject.clone();
        let bus = self.runtime.bus.clone();
        let tail = self.tail.clone();
        stage.forwarder = Some(tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                plan.observe_line(origin, &line);
                tail.push(line.text.clone());
                bus.publish(Event::new(
                    subject.clone(),
                    EventPayload::Log {
                        origin,
                        stream: line.stream,
                        line: line.text,
                    },
                ));
            }
        }));
    }

    fn mark_running(&self, stages: &[Stage]) -> UnitState {
        let helper = stages.iter().find(|s| s.origin == LogOrigin::Helper);
        let exposed = stages.iter().find(|s| s.origin == LogOrigin::Exposed);
        let mut state = self.state();
        state.phase = Phase::Running;
        state.pid = exposed.map(|s| s.pid.0);
        state.exposed_port = exposed.and_then(|s| s.port);
        state.helper_pid = helper.map(|s| s.pid.0);
        state.port = helper.and_then(|s| s.port).or(state.exposed_port);
        state.command = exposed.map(|s| s.command.clone());
        state.started_at = Some(Utc::now());
        state.clone()
    }

    /// Stop stages in reverse spawn order and flush their output.
    /// Returns the outcomes, last-spawned first.
    async fn teardown(&self, stages: &mut Vec<Stage>, plan: &Arc<dyn LaunchPlan>) -> Vec<StopOutcome> {
        let grace = self.runtime.config.stop_grace();
        let mut outcomes = Vec::with_capacity(stages.len());
        while let Some(mut stage) = stages.pop() {
            let outcome = self
                .runtime
                .manager
                .signal_stop(stage.pid, &mut stage.exit, grace)
                .await;
            debug!(unit = %self.subject, origin = ?stage.origin, pid = %stage.pid, ?outcome, "Stage stopped");

            self.start_forwarder(&mut stage, plan);
            if let Some(mut forwarder) = stage.forwarder.take() {
                if tokio::time::timeout(FORWARDER_DRAIN, &mut forwarder).await.is_err() {
                    warn!(unit = %self.subject, pid = %stage.pid, "Output still open after stop, detaching");
                    forwarder.abort();
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn stop(&self) -> Result<UnitState, StudioError> {
        if let Some(token) = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            token.cancel();
        }

        let mut live = self.transition.lock().await;
        let Some(mut unit) = live.take() else {
            return Ok(self.state().clone());
        };

        self.state().phase = Phase::Stopping;
        info!(unit = %self.subject, "Stopping unit");

        let outcomes = self.teardown(&mut unit.stages, &unit.plan).await;
        let exit_code = outcomes.first().and_then(StopOutcome::exit_code);
        self.publish(EventPayload::Stopped { exit_code });

        let mut state = self.state();
        state.last_exit_code = exit_code;
        state.reset(Phase::Stopped);
        info!(unit = %self.subject, ?exit_code, "Unit stopped");
        Ok(state.clone())
    }

    async fn on_unsolicited_exit(&self, generation: u64, origin: LogOrigin, pid: ProcessId, info: ExitInfo) {
        let mut live = self.transition.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation || self.state().phase != Phase::Running {
            return;
        }
        let Some(mut unit) = live.take() else {
            return;
        };

        {
            let mut state = self.state();
            state.phase = Phase::Exited;
            state.last_exit_code = info.code;
        }
        warn!(unit = %self.subject, ?origin, %pid, code = ?info.code, signal = ?info.signal, "Process exited unexpectedly");

        self.teardown(&mut unit.stages, &unit.plan).await;
        self.publish(EventPayload::Exited {
            pid: pid.0,
            exit_code: info.code,
            signal: info.signal,
        });
        self.state().reset(Phase::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_last_exit_code() {
        let mut state = UnitState {
            phase: Phase::Running,
            pid: Some(42),
            port: Some(4000),
            last_exit_code: Some(1),
            ..Default::default()
        };
        state.reset(Phase::Stopped);
        assert_eq!(state.phase, Phase::Stopped);
        assert_eq!(state.pid, None);
        assert_eq!(state.port, None);
        assert_eq!(state.last_exit_code, Some(1));
    }

    #[test]
    fn test_state_serialization() {
        let state = UnitState {
            phase: Phase::Running,
            pid: Some(7),
            helper_pid: Some(6),
            ..Default::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["phase"], "running");
        assert_eq!(value["helperPid"], 6);
        assert!(value["lastExitCode"].is_null());
        assert!(Phase::Starting.is_live());
        assert!(!Phase::Stopping.is_live());
    }
}
