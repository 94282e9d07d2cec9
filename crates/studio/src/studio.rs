use crate::autostart::{AutoStartCoordinator, AutoStartReport, BootSession};
use crate::bus::{EventBus, Subscription};
use crate::factory::PlatformProcessManagerFactory;
use crate::inspector::InspectorManager;
use crate::ports::PortAllocator;
use crate::probe::{Prober, ReadinessProbe};
use crate::registry::FlowRegistry;
use crate::store::FlowStore;
use crate::supervisor::UnitRuntime;
use mcp_studio_core::{ProcessManager, ProcessManagerFactory, StudioConfig, StudioError};
use std::sync::Arc;
use tracing::{info, warn};

/// Entry point of the orchestration core
pub struct Studio {
    runtime: UnitRuntime,
    registry: Arc<FlowRegistry>,
    inspector: Arc<InspectorManager>,
    auto_start: AutoStartCoordinator,
}

impl Studio {
    /// Boot with the platform process manager and the HTTP/TCP prober
    pub async fn boot(config: StudioConfig, store: Arc<dyn FlowStore>) -> Result<Self, StudioError> {
        info!(
            platform = PlatformProcessManagerFactory::platform_name(),
            "Booting studio"
        );
        let manager = PlatformProcessManagerFactory::create_process_manager();
        Self::boot_with(
            config,
            store,
            manager,
            Arc::new(Prober::new()),
            BootSession::current().clone(),
        )
        .await
    }

    /// Boot with explicit collaborators
    pub async fn boot_with(
        config: StudioConfig,
        store: Arc<dyn FlowStore>,
        manager: Arc<dyn ProcessManager>,
        probe: Arc<dyn ReadinessProbe>,
        session: BootSession,
    ) -> Result<Self, StudioError> {
        config.validate()?;
        let config = Arc::new(config);
        let runtime = UnitRuntime {
            manager,
            bus: EventBus::new(config.event_capacity),
            ports: PortAllocator::new(),
            probe,
            config: config.clone(),
        };

        let registry = Arc::new(FlowRegistry::new(store, runtime.clone()));
        registry.load().await?;
        let inspector = Arc::new(InspectorManager::new(runtime.clone()));
        let auto_start =
            AutoStartCoordinator::new(session, registry.clone(), inspector.clone(), config);

        Ok(Self {
            runtime,
            registry,
            inspector,
            auto_start,
        })
    }

    pub fn flows(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn inspector(&self) -> &Arc<InspectorManager> {
        &self.inspector
    }

    pub fn config(&self) -> &StudioConfig {
        &self.runtime.config
    }

    pub fn boot_session(&self) -> &BootSession {
        self.auto_start.session()
    }

    /// Live event feed starting now
    pub fn subscribe(&self) -> Subscription {
        self.runtime.bus.subscribe()
    }

    pub async fn evaluate_auto_start(&self, client_token: Option<&str>) -> AutoStartReport {
        self.auto_start.evaluate(client_token).await
    }

    /// Stop all flows and the inspector, then kill anything still tracked
    pub async fn shutdown(&self) -> Result<(), StudioError> {
        info!("Shutting down studio");
        self.registry.stop_all().await;
        if let Err(e) = self.inspector.stop().await {
            warn!("Failed to stop inspector: {e}");
        }
        self.runtime.manager.cleanup().await?;
        Ok(())
    }
}
