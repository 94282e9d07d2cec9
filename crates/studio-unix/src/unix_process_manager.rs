use crate::tracker::ActiveProcesses;
use anyhow::{Context, Result};
use async_trait::async_trait;
use mcp_studio_core::{
    CommandSpec, ExitInfo, LineSink, ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager,
    ProcessTermination, StreamKind, TerminationResult, pump,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use sysinfo::System;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on waiting for stdout/stderr to reach EOF after exit
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Pause between SIGTERM and SIGKILL when tearing down a whole tree
const TREE_TERM_GRACE: Duration = Duration::from_millis(500);

fn exit_info(status: ExitStatus) -> ExitInfo {
    ExitInfo::new(status.code(), status.signal())
}

/// Unix process handle; its child runs in its own process group
pub struct UnixProcessHandle {
    child: Child,
    pid: ProcessId,
    readers: Vec<JoinHandle<u64>>,
    active: ActiveProcesses,
}

#[async_trait]
impl ProcessHandle for UnixProcessHandle {
    fn get_pid(&self) -> Option<ProcessId> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for process {}", self.pid))?;
        Ok(exit_info(status))
    }

    async fn drain_output(&mut self) {
        let mut held_open = false;
        for mut reader in self.readers.drain(..) {
            match tokio::time::timeout(READER_DRAIN, &mut reader).await {
                Ok(Ok(lines)) => debug!(pid = %self.pid, lines, "Output stream closed"),
                Ok(Err(e)) => warn!(pid = %self.pid, "Output reader failed: {e}"),
                Err(_) => {
                    warn!(pid = %self.pid, "Output still held open by descendants, aborting reader");
                    reader.abort();
                    held_open = true;
                }
            }
        }
        // The group stays tracked so cleanup can still kill its survivors
        if !held_open {
            self.active.remove(self.pid);
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|e| anyhow::anyhow!("Failed to kill process {}: {}", self.pid, e))
    }
}

/// Unix-specific process manager with process group and tree management
pub struct UnixProcessManager {
    system: std::sync::Mutex<System>,
    active: ActiveProcesses,
}

impl Default for UnixProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixProcessManager {
    pub fn new() -> Self {
        info!("Initializing Unix process manager");
        Self {
            system: std::sync::Mutex::new(System::new()),
            active: ActiveProcesses::default(),
        }
    }

    /// Processes spawned by this manager that have not been reaped
    pub fn active_processes(&self) -> &ActiveProcesses {
        &self.active
    }

    /// Signal the process group led by `pid`.
    ///
    /// Every spawned child leads its own group, so the group outlives a
    /// leader that already exited for as long as any member is alive.
    fn signal_group(pid: ProcessId, sig: Signal) -> TerminationResult {
        let result = signal::killpg(NixPid::from_raw(pid.0 as i32), sig);
        Self::termination_result(pid, sig, result, "process group")
    }

    fn signal_single(pid: ProcessId, sig: Signal) -> TerminationResult {
        let result = signal::kill(NixPid::from_raw(pid.0 as i32), sig);
        Self::termination_result(pid, sig, result, "process")
    }

    fn termination_result(
        pid: ProcessId,
        sig: Signal,
        result: nix::Result<()>,
        target: &str,
    ) -> TerminationResult {
        match result {
            Ok(()) => {
                debug!(%pid, ?sig, "Signalled {target}");
                TerminationResult::Success
            }
            Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
            Err(nix::errno::Errno::EPERM) => {
                warn!(%pid, "Permission denied to signal {target}");
                TerminationResult::AccessDenied
            }
            Err(e) => TerminationResult::Failed(format!("{sig:?} failed: {e}")),
        }
    }

    /// Recursively find all child processes, deepest first
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            if process.parent().map(|p| p.as_u32()) == Some(parent_pid) {
                let child_pid = pid.as_u32();
                Self::find_children_recursive(system, child_pid, result);
                result.push(child_pid);
            }
        }
    }
}

#[async_trait]
impl ProcessLifecycle for UnixProcessManager {
    async fn spawn_process(
        &self,
        spec: &CommandSpec,
        sink: LineSink,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // New process group so the whole subtree can be signalled at once
            .process_group(0);

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", spec.program))?;
        let pid = child
            .id()
            .map(ProcessId::from)
            .with_context(|| format!("'{}' exited before its pid was read", spec.program))?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, StreamKind::Stdout, sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, StreamKind::Stderr, sink)));
        }

        self.active.insert(pid, spec.display());
        info!(%pid, command = %spec.display(), "Spawned Unix process");

        Ok(Box::new(UnixProcessHandle {
            child,
            pid,
            readers,
            active: self.active.clone(),
        }))
    }
}

#[async_trait]
impl ProcessTermination for UnixProcessManager {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        let result = Self::signal_group(pid, Signal::SIGTERM);
        if result == TerminationResult::Success {
            info!(%pid, "Sent SIGTERM");
        }
        result
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        // Descendants that left the group would be reparented once the root dies
        let escaped = self.find_child_processes(pid).await.unwrap_or_default();
        let result = Self::signal_group(pid, Signal::SIGKILL);
        for child in escaped {
            Self::signal_single(child, Signal::SIGKILL);
        }
        if result == TerminationResult::Success {
            info!(%pid, "Sent SIGKILL");
        }
        result
    }

    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
        system.refresh_processes_specifics(
            sysinfo::ProcessesToUpdate::All,
            true,
            sysinfo::ProcessRefreshKind::default(),
        );

        let mut children = Vec::new();
        Self::find_children_recursive(&system, parent_pid.0, &mut children);
        Ok(children.into_iter().map(ProcessId::from).collect())
    }

    async fn terminate_process_tree(&self, root_pid: ProcessId) -> TerminationResult {
        info!("Terminating process tree for root PID {root_pid}");

        let children = match self.find_child_processes(root_pid).await {
            Ok(children) => children,
            Err(e) => {
                warn!("Failed to find child processes for PID {root_pid}: {e}");
                Vec::new()
            }
        };

        let root = Self::signal_group(root_pid, Signal::SIGTERM);
        for child in &children {
            Self::signal_single(*child, Signal::SIGTERM);
        }
        if root == TerminationResult::ProcessNotFound && children.is_empty() {
            return TerminationResult::ProcessNotFound;
        }

        tokio::time::sleep(TREE_TERM_GRACE).await;

        for child in &children {
            Self::signal_single(*child, Signal::SIGKILL);
        }
        match Self::signal_group(root_pid, Signal::SIGKILL) {
            TerminationResult::ProcessNotFound => TerminationResult::Success,
            other => other,
        }
    }
}

#[async_trait]
impl ProcessManager for UnixProcessManager {
    async fn cleanup(&self) -> Result<()> {
        let remaining = self.active.snapshot();
        for (pid, label) in remaining {
            match self.terminate_process_tree(pid).await {
                TerminationResult::Success => {
                    info!("Terminated leftover process tree {label} (PID {pid})");
                }
                TerminationResult::ProcessNotFound => {
                    debug!("Process {pid} already terminated");
                }
                other => {
                    warn!("Failed to terminate process {pid}: {other:?}");
                }
            }
        }
        self.active.clear();
        Ok(())
    }
}

impl Drop for UnixProcessManager {
    fn drop(&mut self) {
        self.active.kill_all();
    }
}
