use mcp_studio_core::{ProcessManager, ProcessManagerFactory};
use std::sync::Arc;
use tracing::info;

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    fn create_process_manager() -> Arc<dyn ProcessManager> {
        #[cfg(unix)]
        {
            info!("Creating Unix process manager");
            mcp_studio_unix::UnixProcessManagerFactory::create_process_manager()
        }

        #[cfg(not(unix))]
        {
            compile_error!("Unsupported platform: only Unix is currently supported");
        }
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        {
            mcp_studio_unix::UnixProcessManagerFactory::platform_name()
        }

        #[cfg(not(unix))]
        {
            "Unknown"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_platform_detection() {
        let platform = PlatformProcessManagerFactory::platform_name();
        println!("Running on platform: {platform}");

        let manager = PlatformProcessManagerFactory::create_process_manager();
        assert!(manager.cleanup().await.is_ok());
    }
}
