//! Authoritative mapping of flow id to definition and supervisor.
//!
//! Definitions are persisted through a [`FlowStore`] before any in-memory
//! change is committed. Live state is never cached here: every view reads it
//! from the flow's [`Supervisor`].

use crate::launch::{FlowLaunch, LaunchPreview};
use crate::store::FlowStore;
use crate::supervisor::{Phase, Supervisor, UnitRuntime, UnitState};
use indexmap::IndexMap;
use mcp_studio_core::{Event, EventPayload, Flow, FlowId, FlowSpec, StudioError, Subject};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

struct FlowEntry {
    flow: RwLock<Flow>,
    /// Serializes definition changes against starts of this flow
    op: tokio::sync::Mutex<()>,
    removed: AtomicBool,
    /// Set from claiming the listen port until `Supervisor::start` returns
    launching: AtomicBool,
    supervisor: Supervisor,
}

/// Clears the launching flag however the start ends
struct Launching<'a>(&'a AtomicBool);

impl Drop for Launching<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FlowEntry {
    fn new(flow: Flow, runtime: UnitRuntime) -> Self {
        let supervisor = Supervisor::new(Subject::Flow(flow.id.clone()), runtime);
        Self {
            flow: RwLock::new(flow),
            op: tokio::sync::Mutex::new(()),
            removed: AtomicBool::new(false),
            launching: AtomicBool::new(false),
            supervisor,
        }
    }

    fn flow(&self) -> Flow {
        self.flow.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn replace(&self, flow: Flow) {
        *self.flow.write().unwrap_or_else(|p| p.into_inner()) = flow;
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn is_launching_or_live(&self) -> bool {
        self.launching.load(Ordering::SeqCst) || self.supervisor.phase() != Phase::Stopped
    }

    fn view(&self) -> FlowView {
        FlowView {
            flow: self.flow(),
            state: self.supervisor.state(),
        }
    }
}

/// A flow definition together with its live state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowView {
    #[serde(flatten)]
    pub flow: Flow,
    pub state: UnitState,
}

pub struct FlowRegistry {
    flows: RwLock<IndexMap<FlowId, Arc<FlowEntry>>>,
    /// Held from building the prospective list until it is committed
    persist: tokio::sync::Mutex<()>,
    /// Last flow to claim each listen port
    listen_ports: Mutex<HashMap<u16, FlowId>>,
    store: Arc<dyn FlowStore>,
    runtime: UnitRuntime,
}

impl FlowRegistry {
    pub fn new(store: Arc<dyn FlowStore>, runtime: UnitRuntime) -> Self {
        Self {
            flows: RwLock::new(IndexMap::new()),
            persist: tokio::sync::Mutex::new(()),
            listen_ports: Mutex::new(HashMap::new()),
            store,
            runtime,
        }
    }

    fn read_map(&self) -> RwLockReadGuard<'_, IndexMap<FlowId, Arc<FlowEntry>>> {
        self.flows.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, IndexMap<FlowId, Arc<FlowEntry>>> {
        self.flows.write().unwrap_or_else(|p| p.into_inner())
    }

    fn entry(&self, id: &FlowId) -> Result<Arc<FlowEntry>, StudioError> {
        self.read_map()
            .get(id)
            .cloned()
            .ok_or_else(|| StudioError::NotFound(id.to_string()))
    }

    fn ensure_route_free(&self, route: &str, owner: Option<&FlowId>) -> Result<(), StudioError> {
        let taken = self
            .read_map()
            .iter()
            .any(|(id, entry)| Some(id) != owner && entry.flow().route == route);
        if taken {
            return Err(StudioError::DuplicateRoute(route.to_string()));
        }
        Ok(())
    }

    /// Claim `port` for `id` and mark it launching, unless another flow that
    /// still listens there is launching or live
    fn claim_listen_port<'a>(
        &self,
        id: &FlowId,
        entry: &'a FlowEntry,
        port: u16,
    ) -> Result<Launching<'a>, StudioError> {
        let mut claims = self.listen_ports.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(holder) = claims.get(&port).filter(|holder| *holder != id) {
            let held = self.read_map().get(holder).cloned().is_some_and(|other| {
                other.is_launching_or_live() && self.launch(other.flow()).listen_port() == port
            });
            if held {
                return Err(StudioError::PortInUse {
                    port,
                    holder: holder.to_string(),
                });
            }
        }
        claims.insert(port, id.clone());
        entry.launching.store(true, Ordering::SeqCst);
        Ok(Launching(&entry.launching))
    }

    /// Persist the current list with `id` replaced by `next`, or dropped when `None`
    async fn save_with(&self, id: &FlowId, next: Option<&Flow>) -> Result<(), StudioError> {
        let prospective: Vec<Flow> = self
            .read_map()
            .iter()
            .filter_map(|(key, entry)| match (key == id, next) {
                (true, Some(flow)) => Some(flow.clone()),
                (true, None) => None,
                (false, _) => Some(entry.flow()),
            })
            .collect();
        self.store.save_all(&prospective).await
    }

    fn launch(&self, flow: Flow) -> FlowLaunch {
        FlowLaunch::new(flow, self.runtime.config.clone())
    }

    /// Populate from the store; flows whose route is already taken are skipped
    pub async fn load(&self) -> Result<usize, StudioError> {
        let flows = self.store.load_all().await?;
        let _persist = self.persist.lock().await;
        let mut map = self.write_map();
        for flow in flows {
            if map.contains_key(&flow.id) || map.values().any(|e| e.flow().route == flow.route) {
                warn!(flow = %flow.id, route = %flow.route, "Skipping stored flow with a duplicate id or route");
                continue;
            }
            let entry = Arc::new(FlowEntry::new(flow.clone(), self.runtime.clone()));
            map.insert(flow.id, entry);
        }
        info!(count = map.len(), "Loaded flow definitions");
        Ok(map.len())
    }

    pub async fn create(&self, spec: FlowSpec) -> Result<Flow, StudioError> {
        let flow = Flow::create(spec)?;
        let _persist = self.persist.lock().await;
        self.ensure_route_free(&flow.route, None)?;

        let mut prospective: Vec<Flow> = self.read_map().values().map(|e| e.flow()).collect();
        prospective.push(flow.clone());
        self.store.save_all(&prospective).await?;

        let entry = Arc::new(FlowEntry::new(flow.clone(), self.runtime.clone()));
        self.write_map().insert(flow.id.clone(), entry);
        info!(flow = %flow.id, route = %flow.route, "Flow created");
        Ok(flow)
    }

    /// Replace a stopped flow's definition
    pub async fn update(&self, id: &FlowId, spec: FlowSpec) -> Result<Flow, StudioError> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;
        if entry.is_removed() {
            return Err(StudioError::NotFound(id.to_string()));
        }
        if entry.supervisor.phase() != Phase::Stopped {
            return Err(StudioError::FlowBusy(id.to_string()));
        }

        let _persist = self.persist.lock().await;
        let mut next = entry.flow();
        next.apply(spec)?;
        self.ensure_route_free(&next.route, Some(id))?;
        self.save_with(id, Some(&next)).await?;
        entry.replace(next.clone());
        info!(flow = %id, route = %next.route, "Flow updated");
        Ok(next)
    }

    /// Toggle auto-start; allowed in any phase
    pub async fn set_auto_start(&self, id: &FlowId, enabled: bool) -> Result<Flow, StudioError> {
        let entry = self.entry(id)?;
        let _persist = self.persist.lock().await;
        if entry.is_removed() {
            return Err(StudioError::NotFound(id.to_string()));
        }
        let mut next = entry.flow();
        next.auto_start = enabled;
        next.updated_at = chrono::Utc::now();
        self.save_with(id, Some(&next)).await?;
        entry.replace(next.clone());
        debug!(flow = %id, enabled, "Auto-start changed");
        Ok(next)
    }

    /// Stop the flow, then forget it
    pub async fn delete(&self, id: &FlowId) -> Result<(), StudioError> {
        let entry = self.entry(id)?;
        entry.supervisor.stop().await?;

        let _op = entry.op.lock().await;
        if entry.is_removed() {
            return Err(StudioError::NotFound(id.to_string()));
        }
        // A start may have completed while we waited for the lock
        entry.supervisor.stop().await?;

        let _persist = self.persist.lock().await;
        self.save_with(id, None).await?;
        entry.removed.store(true, Ordering::SeqCst);
        self.write_map().shift_remove(id);

        let config_path = self.launch(entry.flow()).config_path();
        match tokio::fs::remove_file(&config_path).await {
            Ok(()) => debug!(flow = %id, path = %config_path.display(), "Removed launch config"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(flow = %id, "Failed to remove {}: {e}", config_path.display()),
        }
        info!(flow = %id, "Flow deleted");
        Ok(())
    }

    pub fn get(&self, id: &FlowId) -> Result<FlowView, StudioError> {
        Ok(self.entry(id)?.view())
    }

    /// Point-in-time snapshot in insertion order
    pub fn list(&self) -> Vec<FlowView> {
        let entries: Vec<Arc<FlowEntry>> = self.read_map().values().cloned().collect();
        entries.iter().map(|e| e.view()).collect()
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    pub async fn start(&self, id: &FlowId) -> Result<UnitState, StudioError> {
        let entry = self.entry(id)?;
        let _op = entry.op.lock().await;
        if entry.is_removed() {
            return Err(StudioError::NotFound(id.to_string()));
        }
        let plan = Arc::new(self.launch(entry.flow()));
        let _launching = match self.claim_listen_port(id, &entry, plan.listen_port()) {
            Ok(launching) => launching,
            Err(error) => {
                warn!(flow = %id, "Start refused: {error}");
                self.runtime.bus.publish(Event::new(
                    Subject::Flow(id.clone()),
                    EventPayload::failed(&error),
                ));
                return Err(error);
            }
        };
        entry.supervisor.start(plan).await
    }

    pub async fn stop(&self, id: &FlowId) -> Result<UnitState, StudioError> {
        self.entry(id)?.supervisor.stop().await
    }

    pub fn current_state(&self, id: &FlowId) -> Result<UnitState, StudioError> {
        Ok(self.entry(id)?.supervisor.state())
    }

    pub fn logs(&self, id: &FlowId) -> Result<Vec<String>, StudioError> {
        Ok(self.entry(id)?.supervisor.logs())
    }

    pub fn preview(&self, id: &FlowId) -> Result<LaunchPreview, StudioError> {
        self.launch(self.entry(id)?.flow()).preview()
    }

    /// Flows marked auto-start that are currently stopped
    pub fn auto_start_candidates(&self) -> Vec<FlowId> {
        self.read_map()
            .iter()
            .filter(|(_, e)| e.flow().auto_start && e.supervisor.phase() == Phase::Stopped)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Stop every flow; failures are logged and do not abort the rest
    pub async fn stop_all(&self) {
        let entries: Vec<(FlowId, Arc<FlowEntry>)> = self
            .read_map()
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        for (id, entry) in entries {
            if let Err(e) = entry.supervisor.stop().await {
                warn!(flow = %id, "Failed to stop flow: {e}");
            }
        }
    }
}
