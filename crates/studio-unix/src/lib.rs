#[cfg(unix)]
mod tracker;
#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use tracker::ActiveProcesses;
#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl mcp_studio_core::ProcessManagerFactory for UnixProcessManagerFactory {
    fn create_process_manager() -> std::sync::Arc<dyn mcp_studio_core::ProcessManager> {
        std::sync::Arc::new(UnixProcessManager::new())
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
