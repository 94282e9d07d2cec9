pub mod autostart;
pub mod bus;
pub mod factory;
pub mod inspector;
pub mod launch;
pub mod logs;
pub mod ports;
pub mod probe;
pub mod registry;
pub mod store;
pub mod studio;
pub mod supervisor;

pub use autostart::{AutoStartCoordinator, AutoStartFailure, AutoStartReport, BootSession};
pub use bus::{EventBus, Subscription};
pub use factory::PlatformProcessManagerFactory;
pub use inspector::{InspectorManager, InspectorState};
pub use launch::{CommandPreview, FlowLaunch, HelperStage, LaunchPlan, LaunchPreview, Upstream};
pub use ports::{PortAllocator, PortLease};
pub use probe::{ProbeOutcome, ProbeTarget, Prober, ReadinessProbe};
pub use registry::{FlowRegistry, FlowView};
pub use store::{FlowStore, JsonFileStore, MemoryStore};
pub use studio::Studio;
pub use supervisor::{Phase, Supervisor, UnitRuntime, UnitState};

// Re-export core functionality
pub use mcp_studio_core::*;
