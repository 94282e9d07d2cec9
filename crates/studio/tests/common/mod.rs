#![allow(dead_code)]

use async_trait::async_trait;
use mcp_studio::{
    CommandSpec, Event, EventBus, EventKind, HelperStage, LaunchPlan, PlatformProcessManagerFactory,
    PortAllocator, ProbeConfig, ProbeOutcome, ProbeStrategy, ProbeTarget, ProcessManagerFactory,
    Prober, ReadinessProbe, StudioConfig, StudioError, Subscription, UnitRuntime, Upstream,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> StudioConfig {
    StudioConfig {
        stop_grace_ms: 500,
        helper_probe: ProbeConfig {
            timeout_ms: 600,
            interval_ms: 50,
            strategy: ProbeStrategy::PortOpen,
        },
        ..Default::default()
    }
}

pub fn runtime_with(config: StudioConfig, probe: Arc<dyn ReadinessProbe>) -> UnitRuntime {
    UnitRuntime {
        manager: PlatformProcessManagerFactory::create_process_manager(),
        bus: EventBus::new(config.event_capacity),
        ports: PortAllocator::new(),
        probe,
        config: Arc::new(config),
    }
}

pub fn runtime() -> UnitRuntime {
    runtime_with(test_config(), Arc::new(Prober::new()))
}

/// `sh -c <script>`
pub fn shell(script: &str) -> CommandSpec {
    CommandSpec::from_command_line("sh")
        .unwrap()
        .with_args(["-c", script])
}

/// Probe answering with a fixed outcome, or waiting for cancellation
pub enum FakeProbe {
    Ready(Duration),
    Hang,
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn wait_ready(
        &self,
        _target: &ProbeTarget,
        _config: &ProbeConfig,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        match self {
            FakeProbe::Ready(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => ProbeOutcome::Cancelled,
                    _ = tokio::time::sleep(*delay) => ProbeOutcome::Ready,
                }
            }
            FakeProbe::Hang => {
                cancel.cancelled().await;
                ProbeOutcome::Cancelled
            }
        }
    }
}

/// Launch plan over fixed command lines
pub struct ScriptPlan {
    pub helper: Option<CommandSpec>,
    pub exposed: CommandSpec,
}

impl ScriptPlan {
    pub fn single(exposed: CommandSpec) -> Arc<Self> {
        Arc::new(Self {
            helper: None,
            exposed,
        })
    }

    /// The helper script receives `--port P` as `$1 $2`
    pub fn two_stage(helper_script: &str, exposed: CommandSpec) -> Arc<Self> {
        Arc::new(Self {
            helper: Some(shell(helper_script).with_args(["helper"])),
            exposed,
        })
    }
}

#[async_trait]
impl LaunchPlan for ScriptPlan {
    fn label(&self) -> String {
        "script".to_string()
    }

    fn helper(&self) -> Option<HelperStage> {
        self.helper.clone().map(|command| HelperStage {
            command,
            port_flag: "--port".to_string(),
            upstream_path: "/mcp".to_string(),
        })
    }

    async fn exposed(&self, _upstream: Option<&Upstream>) -> Result<CommandSpec, StudioError> {
        Ok(self.exposed.clone())
    }
}

pub fn pid_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // A zombie waiting for its new parent to reap it still answers signal 0
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .is_none_or(|rest| !rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

/// Whether `pid` is gone within `limit`
pub async fn gone_within(pid: u32, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while pid_alive(pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Next event of `kind`, skipping others
pub async fn next_of(events: &mut Subscription, kind: EventKind) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.next().await {
                Some(event) if event.kind() == kind => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind:?} event within 10s"))
}

/// Every event already queued, without waiting
pub fn drain(events: &mut Subscription) -> Vec<Event> {
    std::iter::from_fn(|| events.try_next()).collect()
}
