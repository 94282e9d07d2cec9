use crate::command::CommandSpec;
use crate::lines::LineSink;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a force-killed process is given to be reaped
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Longest pause between SIGTERM and SIGKILL for the remnants of an exited group
const GROUP_SWEEP_GRACE: Duration = Duration::from_millis(250);

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How and when a child process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ExitInfo {
    pub fn new(code: Option<i32>, signal: Option<i32>) -> Self {
        Self {
            code,
            signal,
            at: Utc::now(),
        }
    }

    /// Exit whose status could not be collected
    pub fn unknown() -> Self {
        Self::new(None, None)
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Outcome of a graceful stop with escalation
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// The process was gone before any signal was sent
    AlreadyExited(ExitInfo),
    /// The process honoured the termination request within the grace period
    Graceful(ExitInfo),
    /// The grace period ran out and the process was killed
    Forced(Option<ExitInfo>),
}

impl StopOutcome {
    /// Exit code to report; a forced kill has none
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StopOutcome::AlreadyExited(info) | StopOutcome::Graceful(info) => info.code,
            StopOutcome::Forced(_) => None,
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self, StopOutcome::Forced(_))
    }
}

/// Trait representing a handle to a running process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None if process has exited and been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Wait for the process itself to exit
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Wait, bounded, for stdout/stderr to close once the process has exited.
    /// Descendants that inherited the pipes keep them open until they die.
    async fn drain_output(&mut self);

    /// Kill the process immediately
    async fn kill(&mut self) -> Result<()>;
}

/// Spawning side of a process manager
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a child whose stdout/stderr lines are delivered to `sink`
    async fn spawn_process(
        &self,
        spec: &CommandSpec,
        sink: LineSink,
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// Signal-based termination, addressed by pid so the owning handle can stay
/// with its exit observer
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask the process (and its group) to terminate
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Kill the process (and its group) without grace
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Find all descendants of a given process
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Kill an entire process tree, descendants first
    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult;

    /// Terminate what is left of the group of a leader that already exited
    async fn sweep_group(&self, pid: ProcessId, grace: Duration) {
        if self.terminate_gracefully(pid).await != TerminationResult::Success {
            return;
        }
        warn!(%pid, "Process group outlived its leader, terminating it");
        tokio::time::sleep(grace.min(GROUP_SWEEP_GRACE)).await;
        match self.force_kill(pid).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => warn!(%pid, result = ?other, "Force kill of group remnants failed"),
        }
    }

    /// Graceful termination escalating to a forceful kill after `grace`.
    ///
    /// The leader's group is signalled even when the leader is already gone,
    /// so wrappers that exited or crashed do not leave their children behind.
    async fn signal_stop(
        &self,
        pid: ProcessId,
        exit: &mut ExitWatch,
        grace: Duration,
    ) -> StopOutcome {
        if let Some(info) = exit.current() {
            self.sweep_group(pid, grace).await;
            return StopOutcome::AlreadyExited(info);
        }

        match self.terminate_gracefully(pid).await {
            TerminationResult::Success => {}
            TerminationResult::ProcessNotFound => {
                // Exited between the check and the signal; the observer reports it shortly
                return match exit.wait_for(FORCE_KILL_WAIT).await {
                    Some(info) => StopOutcome::AlreadyExited(info),
                    None => StopOutcome::Forced(None),
                };
            }
            other => {
                warn!(%pid, result = ?other, "Graceful termination failed, escalating");
            }
        }

        if let Some(info) = exit.wait_for(grace).await {
            info!(%pid, code = ?info.code, "Process stopped gracefully");
            return StopOutcome::Graceful(info);
        }

        warn!(%pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing process");
        match self.force_kill(pid).await {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {}
            other => warn!(%pid, result = ?other, "Force kill failed"),
        }
        StopOutcome::Forced(exit.wait_for(FORCE_KILL_WAIT).await)
    }
}

/// High-level process manager trait that combines lifecycle and termination
#[async_trait]
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Kill every child this manager still tracks
    async fn cleanup(&self) -> Result<()>;
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// Create a process manager for the current platform
    fn create_process_manager() -> Arc<dyn ProcessManager>;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}

/// Read side of a process's single exit observation
#[derive(Clone, Debug)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitInfo>>,
}

impl ExitWatch {
    pub fn current(&self) -> Option<ExitInfo> {
        self.rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves once the process has exited
    pub async fn exited(&mut self) -> ExitInfo {
        let observed = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        observed
            .or_else(|| self.current())
            .unwrap_or_else(ExitInfo::unknown)
    }

    /// Like [`ExitWatch::exited`], bounded by `limit`
    pub async fn wait_for(&mut self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.exited()).await.ok()
    }
}

/// Move `handle` into a task that waits for its exit exactly once.
///
/// The returned watch can be cloned freely; every clone sees the same
/// `ExitInfo`. The exit is published before the output is drained, and the
/// handle is dropped once draining finished.
pub fn observe_exit(mut handle: Box<dyn ProcessHandle>) -> (ExitWatch, JoinHandle<()>) {
    let (tx, rx) = watch::channel(None);
    let pid = handle.get_pid();
    let task = tokio::spawn(async move {
        let info = match handle.wait().await {
            Ok(info) => info,
            Err(e) => {
                warn!(pid = ?pid, "Failed to collect exit status: {e:#}");
                ExitInfo::unknown()
            }
        };
        debug!(pid = ?pid, code = ?info.code, signal = ?info.signal, "Process exit observed");
        tx.send_replace(Some(info));
        handle.drain_output().await;
    });
    (ExitWatch { rx }, task)
}
