//! Translating a flow definition into the processes that run it.
//!
//! A [`LaunchPlan`] describes an optional bridging helper and the exposed
//! process. The supervisor only sees this trait; [`FlowLaunch`] renders the
//! proxy configuration for flows and the inspector provides its own plan.

use async_trait::async_trait;
use mcp_studio_core::{
    CommandSpec, Flow, LogOrigin, OutputLine, RemoteTransport, Source, StudioConfig, StudioError,
    Target,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Placeholder shown in previews where a port is chosen at start time
const AUTO_PORT: &str = "<auto>";

/// Bridging process started before the exposed one
#[derive(Debug, Clone, PartialEq)]
pub struct HelperStage {
    /// Command line without the port argument
    pub command: CommandSpec,
    pub port_flag: String,
    /// Path of the MCP endpoint the helper serves
    pub upstream_path: String,
}

impl HelperStage {
    pub fn command(&self, port: u16) -> CommandSpec {
        self.command
            .clone()
            .with_args([self.port_flag.clone(), port.to_string()])
            .with_port(port)
    }

    pub fn upstream(&self, port: u16) -> Upstream {
        Upstream {
            port,
            url: format!("http://127.0.0.1:{port}{}", self.upstream_path),
        }
    }
}

/// A ready helper the exposed process attaches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub port: u16,
    pub url: String,
}

/// What a supervisor needs to bring one unit up
#[async_trait]
pub trait LaunchPlan: Send + Sync {
    /// Name used in logs
    fn label(&self) -> String;

    /// The bridging helper, for two-stage units
    fn helper(&self) -> Option<HelperStage> {
        None
    }

    /// The exposed process, attached to `upstream` when there is a helper
    async fn exposed(&self, upstream: Option<&Upstream>) -> Result<CommandSpec, StudioError>;

    /// Sees every captured line, in order, before it is published
    fn observe_line(&self, _origin: LogOrigin, _line: &OutputLine) {}
}

/// One rendered command line and whether its binary resolves on `PATH`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandPreview {
    pub command: String,
    pub program: String,
    pub found: bool,
}

impl CommandPreview {
    fn new(spec: &CommandSpec, command: String) -> Self {
        Self {
            found: which::which(&spec.program).is_ok(),
            program: spec.program.clone(),
            command,
        }
    }
}

/// What starting a flow would run, without running it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helper: Option<CommandPreview>,
    pub exposed: CommandPreview,
    pub port: u16,
    pub config: Value,
}

/// Launch plan of a flow: proxy config file plus optional OpenAPI helper
#[derive(Debug, Clone)]
pub struct FlowLaunch {
    flow: Flow,
    config: Arc<StudioConfig>,
}

impl FlowLaunch {
    pub fn new(flow: Flow, config: Arc<StudioConfig>) -> Self {
        Self { flow, config }
    }

    /// Port the exposed process binds
    pub fn listen_port(&self) -> u16 {
        self.flow.listen_port.unwrap_or(match self.flow.target {
            Target::Sse => self.config.sse_port,
            Target::StreamableHttp => self.config.stream_port,
            Target::Openapi => self.config.openapi_port,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .runtime_dir()
            .join(format!("{}.config.json", self.flow.id))
    }

    fn command_line(line: &str, name: &str) -> Result<CommandSpec, StudioError> {
        CommandSpec::from_command_line(line)
            .ok_or_else(|| StudioError::Configuration(format!("{name} is empty")))
    }

    fn server_entry(&self, upstream_url: Option<&str>) -> Result<Value, StudioError> {
        let mut entry = Map::new();
        match &self.flow.source {
            Source::LocalCommand { command, args, env } => {
                entry.insert("command".into(), json!(command));
                if !args.is_empty() {
                    entry.insert("args".into(), json!(args));
                }
                if !env.is_empty() {
                    entry.insert("env".into(), json!(env));
                }
            }
            Source::Remote {
                url,
                headers,
                transport,
            } => {
                entry.insert("url".into(), json!(url));
                if !headers.is_empty() {
                    let rendered: Value = match self.flow.target {
                        Target::Openapi => headers
                            .iter()
                            .map(|h| (h.key.clone(), json!(h.value)))
                            .collect::<Map<_, _>>()
                            .into(),
                        _ => headers.iter().map(|h| json!({ &h.key: &h.value })).collect(),
                    };
                    entry.insert("headers".into(), rendered);
                }
                self.insert_transport(&mut entry, *transport);
            }
            Source::Openapi { .. } => {
                let url = upstream_url.ok_or_else(|| {
                    StudioError::Spawn("OpenAPI helper is not running".to_string())
                })?;
                entry.insert("url".into(), json!(url));
                self.insert_transport(&mut entry, RemoteTransport::StreamableHttp);
            }
        }
        Ok(Value::Object(entry))
    }

    fn insert_transport(&self, entry: &mut Map<String, Value>, transport: RemoteTransport) {
        let key = match self.flow.target {
            Target::Openapi => "type",
            _ => "transportType",
        };
        entry.insert(key.into(), json!(transport.proxy_name()));
    }

    /// Config document handed to the exposed process
    pub fn render_config(&self, upstream_url: Option<&str>) -> Result<Value, StudioError> {
        let entry = self.server_entry(upstream_url)?;
        let servers = json!({ &self.flow.route: entry });
        if self.flow.target == Target::Openapi {
            return Ok(json!({ "mcpServers": servers }));
        }

        let port = self.listen_port();
        let proxy_type = match self.flow.target {
            Target::StreamableHttp => "streamable-http",
            _ => "sse",
        };
        Ok(json!({
            "mcpProxy": {
                "baseURL": format!("http://{}:{}", self.config.host, port),
                "addr": format!(":{port}"),
                "name": self.flow.name,
                "version": "1.0.0",
                "type": proxy_type,
                "options": { "panicIfInvalid": false, "logEnabled": true },
            },
            "mcpServers": servers,
        }))
    }

    fn exposed_command(&self) -> Result<CommandSpec, StudioError> {
        let path = self.config_path().display().to_string();
        let port = self.listen_port();
        let spec = match self.flow.target {
            Target::Openapi => Self::command_line(&self.config.openapi_bin, "openapi_bin")?
                .with_args([
                    "--port".to_string(),
                    port.to_string(),
                    "--config".to_string(),
                    path,
                    "--hot-reload".to_string(),
                ]),
            _ => Self::command_line(&self.config.proxy_bin, "proxy_bin")?
                .with_args(["-config".to_string(), path]),
        };
        Ok(spec.with_port(port))
    }

    /// Render both stages without spawning or writing anything
    pub fn preview(&self) -> Result<LaunchPreview, StudioError> {
        let helper = self.helper().map(|stage| {
            let line = format!(
                "{} {} {AUTO_PORT}",
                stage.command.display(),
                stage.port_flag
            );
            CommandPreview::new(&stage.command, line)
        });
        let upstream = self
            .helper()
            .map(|stage| format!("http://127.0.0.1:{AUTO_PORT}{}", stage.upstream_path));
        let exposed = self.exposed_command()?;
        Ok(LaunchPreview {
            helper,
            exposed: CommandPreview::new(&exposed, exposed.display()),
            port: self.listen_port(),
            config: self.render_config(upstream.as_deref())?,
        })
    }
}

#[async_trait]
impl LaunchPlan for FlowLaunch {
    fn label(&self) -> String {
        format!("flow {} ({})", self.flow.route, self.flow.id)
    }

    fn helper(&self) -> Option<HelperStage> {
        let Source::Openapi { base_url, spec_url } = &self.flow.source else {
            return None;
        };
        let command = CommandSpec::from_command_line(&self.config.openapi_helper_bin)?
            .with_args([
                "--api-base-url",
                base_url.as_str(),
                "--openapi-spec",
                spec_url.as_str(),
                "--transport",
                "http",
            ]);
        Some(HelperStage {
            command,
            port_flag: "--port".to_string(),
            upstream_path: "/mcp".to_string(),
        })
    }

    async fn exposed(&self, upstream: Option<&Upstream>) -> Result<CommandSpec, StudioError> {
        if self.flow.is_two_stage() && upstream.is_none() {
            return Err(StudioError::Configuration(
                "openapi_helper_bin is empty".to_string(),
            ));
        }
        let document = self.render_config(upstream.map(|u| u.url.as_str()))?;
        let path = self.config_path();
        let rendered = serde_json::to_vec_pretty(&document)
            .map_err(|e| StudioError::Other(e.into()))?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                StudioError::Spawn(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        tokio::fs::write(&path, rendered)
            .await
            .map_err(|e| StudioError::Spawn(format!("cannot write {}: {e}", path.display())))?;
        debug!(flow = %self.flow.id, config = %path.display(), "Wrote launch config");

        let spec = self.exposed_command()?;
        info!(flow = %self.flow.id, port = self.listen_port(), command = %spec.display(), "Prepared exposed process");
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_studio_core::{FlowSpec, Header};
    use std::collections::BTreeMap;

    fn config(dir: &std::path::Path) -> Arc<StudioConfig> {
        Arc::new(StudioConfig {
            data_path: dir.join("flows.json"),
            proxy_bin: "mcp-proxy".into(),
            ..Default::default()
        })
    }

    fn openapi_flow() -> Flow {
        Flow::create(
            FlowSpec::new(
                "Demo",
                Source::Openapi {
                    base_url: "http://x/api".into(),
                    spec_url: "http://x/spec.json".into(),
                },
                Target::Sse,
            )
            .with_route("demo"),
        )
        .unwrap()
    }

    #[test]
    fn test_local_command_renders_proxy_config() {
        let dir = tempfile::tempdir().unwrap();
        let flow = Flow::create(FlowSpec::new(
            "Everything",
            Source::LocalCommand {
                command: "npx".into(),
                args: vec!["-y".into(), "server-everything".into()],
                env: BTreeMap::from([("DEBUG".to_string(), "1".to_string())]),
            },
            Target::Sse,
        ))
        .unwrap();
        let launch = FlowLaunch::new(flow, config(dir.path()));

        assert!(launch.helper().is_none());
        assert_eq!(launch.listen_port(), 8002);
        let doc = launch.render_config(None).unwrap();
        assert_eq!(doc["mcpProxy"]["addr"], ":8002");
        assert_eq!(doc["mcpProxy"]["type"], "sse");
        assert_eq!(doc["mcpServers"]["everything"]["command"], "npx");
        assert_eq!(doc["mcpServers"]["everything"]["env"]["DEBUG"], "1");
    }

    #[test]
    fn test_remote_headers_and_transport() {
        let dir = tempfile::tempdir().unwrap();
        let flow = Flow::create(
            FlowSpec::new(
                "remote",
                Source::Remote {
                    url: "https://mcp.example.com/sse".into(),
                    headers: vec![Header {
                        key: "Authorization".into(),
                        value: "Bearer t".into(),
                    }],
                    transport: RemoteTransport::Sse,
                },
                Target::StreamableHttp,
            )
            .with_listen_port(9100),
        )
        .unwrap();
        let launch = FlowLaunch::new(flow, config(dir.path()));
        let doc = launch.render_config(None).unwrap();
        let entry = &doc["mcpServers"]["remote"];
        assert_eq!(entry["transportType"], "sse");
        assert_eq!(entry["headers"][0]["Authorization"], "Bearer t");
        assert_eq!(doc["mcpProxy"]["type"], "streamable-http");
        assert_eq!(doc["mcpProxy"]["addr"], ":9100");
    }

    #[test]
    fn test_openapi_target_uses_openapi_binary() {
        let dir = tempfile::tempdir().unwrap();
        let flow = Flow::create(FlowSpec::new(
            "rest",
            Source::Remote {
                url: "http://localhost:8001/mcp".into(),
                headers: vec![],
                transport: RemoteTransport::StreamableHttp,
            },
            Target::Openapi,
        ))
        .unwrap();
        let launch = FlowLaunch::new(flow, config(dir.path()));
        let spec = launch.exposed_command().unwrap();
        assert_eq!(spec.program, "uvx");
        assert!(spec.args.starts_with(&["mcpo".to_string(), "--port".to_string(), "8003".to_string()]));
        assert_eq!(spec.args.last().map(String::as_str), Some("--hot-reload"));
        let doc = launch.render_config(None).unwrap();
        assert!(doc.get("mcpProxy").is_none());
        assert_eq!(doc["mcpServers"]["rest"]["type"], "streamable-http");
    }

    #[tokio::test]
    async fn test_openapi_source_is_two_stage() {
        let dir = tempfile::tempdir().unwrap();
        let launch = FlowLaunch::new(openapi_flow(), config(dir.path()));

        let helper = launch.helper().expect("openapi flows need a helper");
        let command = helper.command(4555);
        assert_eq!(command.port, Some(4555));
        assert!(command.display().ends_with("--transport http --port 4555"));
        assert!(command.args.contains(&"http://x/spec.json".to_string()));

        assert!(launch.exposed(None).await.is_err());

        let upstream = helper.upstream(4555);
        let spec = launch.exposed(Some(&upstream)).await.unwrap();
        assert_eq!(spec.program, "mcp-proxy");
        assert_eq!(spec.port, Some(8001));

        let written: Value =
            serde_json::from_slice(&std::fs::read(launch.config_path()).unwrap()).unwrap();
        assert_eq!(written["mcpServers"]["demo"]["url"], "http://127.0.0.1:4555/mcp");
        assert_eq!(
            written["mcpServers"]["demo"]["transportType"],
            "streamable-http"
        );
    }

    #[test]
    fn test_preview_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let launch = FlowLaunch::new(openapi_flow(), config(dir.path()));
        let preview = launch.preview().unwrap();
        assert!(preview.helper.unwrap().command.ends_with("--port <auto>"));
        assert_eq!(preview.exposed.program, "mcp-proxy");
        assert_eq!(preview.port, 8001);
        assert!(!launch.config_path().exists());
    }
}
