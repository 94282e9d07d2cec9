//! Persistence boundary for flow definitions.

use anyhow::Context;
use async_trait::async_trait;
use mcp_studio_core::{Flow, StudioError};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Load-all / save-all storage for flow definitions
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Flow>, StudioError>;

    /// Replace the stored list; must not leave a partially written file behind
    async fn save_all(&self, flows: &[Flow]) -> Result<(), StudioError>;
}

/// Pretty-printed JSON array on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, flows: &[Flow]) -> anyhow::Result<()> {
        let rendered = serde_json::to_vec_pretty(flows).context("Failed to serialize flows")?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, rendered)
            .await
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl FlowStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<Flow>, StudioError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No flow file yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(StudioError::Persistence(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|e| {
            StudioError::Persistence(format!("corrupt flow file {}: {e}", self.path.display()))
        })
    }

    async fn save_all(&self, flows: &[Flow]) -> Result<(), StudioError> {
        self.write(flows).await.map_err(|e| {
            warn!(path = %self.path.display(), "Failed to persist flows: {e:#}");
            StudioError::Persistence(format!("{e:#}"))
        })
    }
}

/// In-memory store, mainly for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    flows: Mutex<Vec<Flow>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flows(flows: Vec<Flow>) -> Self {
        Self {
            flows: Mutex::new(flows),
            ..Default::default()
        }
    }

    /// Make every following `save_all` fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<Flow> {
        self.flows.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<Flow>, StudioError> {
        Ok(self.saved())
    }

    async fn save_all(&self, flows: &[Flow]) -> Result<(), StudioError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StudioError::Persistence("store unavailable".to_string()));
        }
        *self.flows.lock().unwrap_or_else(|p| p.into_inner()) = flows.to_vec();
        Ok(())
    }
}
