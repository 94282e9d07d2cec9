use crate::error::StudioError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Inspector's built-in proxy port; anything else must be passed in the URL
pub const DEFAULT_INSPECTOR_SERVER_PORT: u16 = 6277;

/// How a freshly spawned helper is judged reachable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeStrategy {
    /// A TCP connect to the helper port succeeds
    #[default]
    PortOpen,
    /// `GET http://127.0.0.1:{port}{path}` answers with anything but 404
    Http { path: String },
}

impl FromStr for ProbeStrategy {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("port") {
            return Ok(ProbeStrategy::PortOpen);
        }
        match s.split_once(':') {
            Some((scheme, path)) if scheme.eq_ignore_ascii_case("http") => {
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{path}")
                };
                Ok(ProbeStrategy::Http { path })
            }
            _ => Err(StudioError::Configuration(format!(
                "unknown probe strategy '{s}', expected 'port' or 'http:<path>'"
            ))),
        }
    }
}

/// Readiness polling budget for helper processes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Total time to wait for the helper (in milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Fixed delay between two connectivity checks (in milliseconds)
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,

    #[serde(default)]
    pub strategy: ProbeStrategy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            interval_ms: default_probe_interval_ms(),
            strategy: ProbeStrategy::default(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), StudioError> {
        if self.interval_ms == 0 {
            return Err(StudioError::Configuration(
                "probe interval must be greater than zero".into(),
            ));
        }
        if self.interval_ms > self.timeout_ms {
            return Err(StudioError::Configuration(
                "probe interval cannot be greater than probe timeout".into(),
            ));
        }
        Ok(())
    }
}

/// Process-wide settings consumed by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[serde(rename_all = "camelCase", default)]
#[builder(default, setter(into))]
pub struct StudioConfig {
    /// Generic proxy exposing SSE / streamable HTTP endpoints
    pub proxy_bin: String,
    /// Proxy exposing an OpenAPI surface
    pub openapi_bin: String,
    /// Bridge turning an OpenAPI description into a local MCP endpoint
    pub openapi_helper_bin: String,
    pub inspector_bin: String,

    /// Bind host handed to exposed proxies
    pub host: String,
    /// Externally visible host used in URLs shown to operators
    pub public_host: String,

    pub sse_port: u16,
    pub stream_port: u16,
    pub openapi_port: u16,

    pub inspector_port: u16,
    pub inspector_server_port: u16,
    pub inspector_host: String,

    /// Flow definitions file; the runtime directory sits next to it
    pub data_path: PathBuf,

    pub helper_probe: ProbeConfig,
    pub stop_grace_ms: u64,

    /// Bounded queue length per event subscriber
    pub event_capacity: usize,
    /// Bounded queue of captured output lines per child process
    pub line_buffer: usize,
    pub log_tail_lines: usize,

    pub auto_start_enabled: bool,
    pub inspector_auto_start: bool,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            proxy_bin: "mcp-proxy".to_string(),
            openapi_bin: "uvx mcpo".to_string(),
            openapi_helper_bin: "npx -y @ivotoby/openapi-mcp-server".to_string(),
            inspector_bin: "npx -y @modelcontextprotocol/inspector".to_string(),
            host: "0.0.0.0".to_string(),
            public_host: "localhost".to_string(),
            sse_port: 8002,
            stream_port: 8001,
            openapi_port: 8003,
            inspector_port: 6275,
            inspector_server_port: 6285,
            inspector_host: "0.0.0.0".to_string(),
            data_path: PathBuf::from("data").join("flows.json"),
            helper_probe: ProbeConfig::default(),
            stop_grace_ms: 5_000,
            event_capacity: 100,
            line_buffer: 1_024,
            log_tail_lines: 200,
            auto_start_enabled: true,
            inspector_auto_start: false,
        }
    }
}

impl StudioConfig {
    pub fn builder() -> StudioConfigBuilder {
        StudioConfigBuilder::default()
    }

    /// Read the process environment on top of the defaults
    pub fn from_env() -> Result<Self, StudioError> {
        let defaults = Self::default();
        let helper_probe = ProbeConfig {
            timeout_ms: env_or("MCP_HELPER_PROBE_TIMEOUT_MS", defaults.helper_probe.timeout_ms)?,
            interval_ms: env_or("MCP_HELPER_PROBE_INTERVAL_MS", defaults.helper_probe.interval_ms)?,
            strategy: env_or("MCP_HELPER_PROBE", defaults.helper_probe.strategy.clone())?,
        };

        let config = Self {
            proxy_bin: env_or("MCP_PROXY_BIN", defaults.proxy_bin)?,
            openapi_bin: env_or("MCP_OPENAPI_BIN", defaults.openapi_bin)?,
            openapi_helper_bin: env_or("MCP_OPENAPI_HELPER_BIN", defaults.openapi_helper_bin)?,
            inspector_bin: env_or("MCP_INSPECTOR_BIN", defaults.inspector_bin)?,
            host: env_or("MCP_STUDIO_HOST", defaults.host)?,
            public_host: env_or("MCP_INSPECTOR_PUBLIC_HOST", defaults.public_host)?,
            sse_port: env_or("MCP_SSE_PORT", defaults.sse_port)?,
            stream_port: env_or("MCP_STREAM_PORT", defaults.stream_port)?,
            openapi_port: env_or("MCP_OPENAPI_PORT", defaults.openapi_port)?,
            inspector_port: env_or("MCP_INSPECTOR_PORT", defaults.inspector_port)?,
            inspector_server_port: env_or(
                "MCP_INSPECTOR_SERVER_PORT",
                defaults.inspector_server_port,
            )?,
            inspector_host: env_or("MCP_INSPECTOR_HOST", defaults.inspector_host)?,
            data_path: env_or("MCP_DASH_DATA", defaults.data_path)?,
            helper_probe,
            stop_grace_ms: env_or("MCP_STOP_GRACE_MS", defaults.stop_grace_ms)?,
            auto_start_enabled: env_or("MCP_STUDIO_AUTO_START", defaults.auto_start_enabled)?,
            inspector_auto_start: env_or(
                "MCP_INSPECTOR_AUTO_START",
                defaults.inspector_auto_start,
            )?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), StudioError> {
        let ports = [
            ("sse_port", self.sse_port),
            ("stream_port", self.stream_port),
            ("openapi_port", self.openapi_port),
            ("inspector_port", self.inspector_port),
            ("inspector_server_port", self.inspector_server_port),
        ];
        if let Some((name, _)) = ports.iter().find(|(_, port)| *port == 0) {
            return Err(StudioError::Configuration(format!("{name} cannot be 0")));
        }

        if self.event_capacity == 0 || self.line_buffer == 0 {
            return Err(StudioError::Configuration(
                "event_capacity and line_buffer must be greater than zero".into(),
            ));
        }

        if self.stop_grace_ms == 0 {
            return Err(StudioError::Configuration(
                "stop_grace_ms must be greater than zero".into(),
            ));
        }

        for (name, bin) in [
            ("proxy_bin", &self.proxy_bin),
            ("openapi_bin", &self.openapi_bin),
            ("openapi_helper_bin", &self.openapi_helper_bin),
            ("inspector_bin", &self.inspector_bin),
        ] {
            if bin.trim().is_empty() {
                return Err(StudioError::Configuration(format!("{name} cannot be empty")));
            }
        }

        self.helper_probe.validate()
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Directory holding rendered launch configs
    pub fn runtime_dir(&self) -> PathBuf {
        self.data_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("runtime")
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, StudioError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| StudioError::Configuration(format!("{key}={raw}: {e}"))),
        _ => Ok(default),
    }
}

// Default value functions for serde
fn default_probe_timeout_ms() -> u64 {
    15_000
}
fn default_probe_interval_ms() -> u64 {
    400
}
