//! Once-per-boot launch of auto-start flows and the inspector.
//!
//! Clients remember the boot token they were last handed. A client presenting
//! the current token merely reloaded; anything else means the orchestrator
//! restarted since the client last looked, and the bulk start runs, at most
//! once per boot session.

use crate::inspector::InspectorManager;
use crate::registry::FlowRegistry;
use chrono::{DateTime, Utc};
use mcp_studio_core::{ErrorKind, FlowId, StudioConfig, StudioError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

static CURRENT: OnceLock<BootSession> = OnceLock::new();

/// Identifier of one run of the orchestrator process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootSession {
    token: String,
    started_at: DateTime<Utc>,
}

impl BootSession {
    /// The session of this process, minted on first use
    pub fn current() -> &'static BootSession {
        CURRENT.get_or_init(Self::mint)
    }

    /// A fresh, unrelated session
    pub fn mint() -> Self {
        Self {
            token: uuid::Uuid::new_v4().simple().to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoStartFailure {
    pub flow: FlowId,
    pub error: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoStartReport {
    pub triggered: bool,
    pub boot_token: String,
    pub started: Vec<FlowId>,
    pub failed: Vec<AutoStartFailure>,
    pub inspector_started: bool,
}

impl AutoStartReport {
    fn skipped(boot_token: &str) -> Self {
        Self {
            triggered: false,
            boot_token: boot_token.to_string(),
            started: Vec::new(),
            failed: Vec::new(),
            inspector_started: false,
        }
    }
}

pub struct AutoStartCoordinator {
    session: BootSession,
    registry: Arc<FlowRegistry>,
    inspector: Arc<InspectorManager>,
    config: Arc<StudioConfig>,
    fired: AtomicBool,
}

impl AutoStartCoordinator {
    pub fn new(
        session: BootSession,
        registry: Arc<FlowRegistry>,
        inspector: Arc<InspectorManager>,
        config: Arc<StudioConfig>,
    ) -> Self {
        Self {
            session,
            registry,
            inspector,
            config,
            fired: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &BootSession {
        &self.session
    }

    /// Run the bulk start if `client_token` predates this boot session.
    ///
    /// Individual flow failures are collected in the report (and published
    /// as `failed` events by their supervisors); they never abort the batch.
    pub async fn evaluate(&self, client_token: Option<&str>) -> AutoStartReport {
        let token = self.session.token();
        if client_token == Some(token) {
            debug!("Client already saw this boot session, skipping auto-start");
            return AutoStartReport::skipped(token);
        }
        let flows_enabled = self.config.auto_start_enabled;
        let inspector_enabled = self.config.inspector_auto_start;
        if !flows_enabled && !inspector_enabled {
            return AutoStartReport::skipped(token);
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("Auto-start already ran for this boot session");
            return AutoStartReport::skipped(token);
        }

        info!(boot = token, "Running auto-start for new boot session");
        let flows = async {
            if flows_enabled {
                self.start_flows().await
            } else {
                (Vec::new(), Vec::new())
            }
        };
        let inspector = async {
            if !inspector_enabled {
                return false;
            }
            match self.inspector.start().await {
                Ok(_) => true,
                Err(StudioError::AlreadyRunning(_)) => false,
                Err(e) => {
                    warn!("Inspector auto-start failed: {e}");
                    false
                }
            }
        };
        let ((started, failed), inspector_started) = tokio::join!(flows, inspector);

        info!(
            started = started.len(),
            failed = failed.len(),
            inspector_started,
            "Auto-start finished"
        );
        AutoStartReport {
            triggered: true,
            boot_token: token.to_string(),
            started,
            failed,
            inspector_started,
        }
    }

    async fn start_flows(&self) -> (Vec<FlowId>, Vec<AutoStartFailure>) {
        let mut batch = JoinSet::new();
        for id in self.registry.auto_start_candidates() {
            let registry = self.registry.clone();
            batch.spawn(async move {
                let result = registry.start(&id).await;
                (id, result)
            });
        }

        let mut started = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok((id, Ok(_))) => started.push(id),
                Ok((id, Err(StudioError::AlreadyRunning(_)))) => {
                    debug!(flow = %id, "Flow was started concurrently");
                }
                Ok((id, Err(e))) => {
                    warn!(flow = %id, "Auto-start failed: {e}");
                    failed.push(AutoStartFailure {
                        flow: id,
                        error: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e) => warn!("Auto-start task failed: {e}"),
            }
        }
        (started, failed)
    }
}
