use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error types for studio operations
#[derive(Error, Debug)]
pub enum StudioError {
    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("Flow not found: {0}")]
    NotFound(String),

    #[error("Route already in use: {0}")]
    DuplicateRoute(String),

    #[error("Flow {0} must be stopped before it can be modified")]
    FlowBusy(String),

    #[error("Invalid flow definition: {0}")]
    InvalidFlow(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Port {port} is already held by flow {holder}")]
    PortInUse { port: u16, holder: String },

    #[error("Helper at {target} was not ready after {timeout_ms}ms")]
    ReadinessTimeout { target: String, timeout_ms: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Startup cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Stable, named error kinds the API layer renders messages from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyRunning,
    NotFound,
    DuplicateRoute,
    FlowBusy,
    InvalidFlow,
    SpawnError,
    PortInUse,
    ReadinessTimeout,
    PersistenceError,
    Cancelled,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateRoute => "duplicate_route",
            ErrorKind::FlowBusy => "flow_busy",
            ErrorKind::InvalidFlow => "invalid_flow",
            ErrorKind::SpawnError => "spawn_error",
            ErrorKind::PortInUse => "port_in_use",
            ErrorKind::ReadinessTimeout => "readiness_timeout",
            ErrorKind::PersistenceError => "persistence_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StudioError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            StudioError::NotFound(_) => ErrorKind::NotFound,
            StudioError::DuplicateRoute(_) => ErrorKind::DuplicateRoute,
            StudioError::FlowBusy(_) => ErrorKind::FlowBusy,
            StudioError::InvalidFlow(_) => ErrorKind::InvalidFlow,
            StudioError::Spawn(_) => ErrorKind::SpawnError,
            StudioError::PortInUse { .. } => ErrorKind::PortInUse,
            StudioError::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            StudioError::Persistence(_) => ErrorKind::PersistenceError,
            StudioError::Cancelled => ErrorKind::Cancelled,
            StudioError::Configuration(_) => ErrorKind::Configuration,
            StudioError::Other(_) => ErrorKind::Internal,
        }
    }
}
