//! The single inspector instance.

use crate::launch::{LaunchPlan, Upstream};
use crate::supervisor::{Phase, Supervisor, UnitRuntime};
use async_trait::async_trait;
use mcp_studio_core::{
    CommandSpec, DEFAULT_INSPECTOR_SERVER_PORT, LogOrigin, OutputLine, StudioConfig, StudioError,
    Subject,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Output fragments that mean the inspector UI can be opened
const READY_MARKERS: [&str; 2] = ["proxy server listening", "inspector is up"];

/// Plan for one inspector run; a fresh auth token per start
#[derive(Debug)]
struct InspectorLaunch {
    config: Arc<StudioConfig>,
    token: String,
    ready: AtomicBool,
}

impl InspectorLaunch {
    fn new(config: Arc<StudioConfig>) -> Self {
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            config,
            token,
            ready: AtomicBool::new(false),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn url(&self) -> String {
        let mut url = format!(
            "http://{}:{}/?MCP_PROXY_AUTH_TOKEN={}",
            self.config.public_host, self.config.inspector_port, self.token
        );
        if self.config.inspector_server_port != DEFAULT_INSPECTOR_SERVER_PORT {
            url.push_str(&format!(
                "&MCP_PROXY_PORT={}",
                self.config.inspector_server_port
            ));
        }
        url
    }
}

#[async_trait]
impl LaunchPlan for InspectorLaunch {
    fn label(&self) -> String {
        "inspector".to_string()
    }

    async fn exposed(&self, _upstream: Option<&Upstream>) -> Result<CommandSpec, StudioError> {
        let spec = CommandSpec::from_command_line(&self.config.inspector_bin).ok_or_else(|| {
            StudioError::Configuration("inspector_bin is empty".to_string())
        })?;
        Ok(spec
            .with_env("MCP_PROXY_AUTH_TOKEN", &self.token)
            .with_env("MCP_AUTO_OPEN_ENABLED", "false")
            .with_env("CLIENT_PORT", self.config.inspector_port)
            .with_env("SERVER_PORT", self.config.inspector_server_port)
            .with_env("HOST", &self.config.inspector_host)
            .with_port(self.config.inspector_port))
    }

    fn observe_line(&self, _origin: LogOrigin, line: &OutputLine) {
        if self.is_ready() {
            return;
        }
        let lowered = line.text.to_lowercase();
        if READY_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            self.ready.store(true, Ordering::SeqCst);
            info!(url = %self.url(), "Inspector is ready");
        }
    }
}

/// Inspector state shown to operators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorState {
    pub running: bool,
    pub phase: Phase,
    /// Present once the inspector reported it is serving
    pub url: Option<String>,
    pub port: u16,
    pub pid: Option<u32>,
}

pub struct InspectorManager {
    supervisor: Supervisor,
    config: Arc<StudioConfig>,
    current: Mutex<Option<Arc<InspectorLaunch>>>,
}

impl InspectorManager {
    pub fn new(runtime: UnitRuntime) -> Self {
        let config = runtime.config.clone();
        Self {
            supervisor: Supervisor::new(Subject::Inspector, runtime),
            config,
            current: Mutex::new(None),
        }
    }

    /// Start the inspector; `AlreadyRunning` if an instance is up
    pub async fn start(&self) -> Result<InspectorState, StudioError> {
        let plan = Arc::new(InspectorLaunch::new(self.config.clone()));
        self.supervisor.start(plan.clone()).await?;
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(plan);
        Ok(self.current_state())
    }

    pub async fn stop(&self) -> Result<InspectorState, StudioError> {
        self.supervisor.stop().await?;
        Ok(self.current_state())
    }

    pub async fn restart(&self) -> Result<InspectorState, StudioError> {
        self.stop().await?;
        self.start().await
    }

    pub fn current_state(&self) -> InspectorState {
        let state = self.supervisor.state();
        let running = state.is_running();
        let url = if running {
            self.current
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .as_ref()
                .filter(|plan| plan.is_ready())
                .map(|plan| plan.url())
        } else {
            None
        };
        InspectorState {
            running,
            phase: state.phase,
            url,
            port: self.config.inspector_port,
            pid: state.pid,
        }
    }

    pub fn logs(&self) -> Vec<String> {
        self.supervisor.logs()
    }
}
