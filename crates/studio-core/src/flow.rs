use crate::error::StudioError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Stable identifier of a flow, generated at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn generate() -> Self {
        FlowId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FlowId {
    fn from(value: &str) -> Self {
        FlowId(value.to_string())
    }
}

impl From<String> for FlowId {
    fn from(value: String) -> Self {
        FlowId(value)
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// Wire protocol spoken by a remote MCP endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTransport {
    #[default]
    Sse,
    StreamableHttp,
}

impl RemoteTransport {
    /// Spelling used by the proxy's config file
    pub fn proxy_name(&self) -> &'static str {
        match self {
            RemoteTransport::Sse => "sse",
            RemoteTransport::StreamableHttp => "streamable-http",
        }
    }
}

/// Where a flow's MCP traffic comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    LocalCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Remote {
        url: String,
        #[serde(default)]
        headers: Vec<Header>,
        #[serde(default)]
        transport: RemoteTransport,
    },
    Openapi {
        base_url: String,
        spec_url: String,
    },
}

impl Source {
    /// Sources that need a bridging helper before the exposed proxy can attach
    pub fn is_two_stage(&self) -> bool {
        matches!(self, Source::Openapi { .. })
    }
}

/// How a flow is exposed to clients. A local-command target does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    #[default]
    Sse,
    StreamableHttp,
    Openapi,
}

/// Operator-supplied flow definition, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub name: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub source: Source,
    #[serde(default)]
    pub target: Target,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

fn default_auto_start() -> bool {
    true
}

impl FlowSpec {
    pub fn new(name: impl Into<String>, source: Source, target: Target) -> Self {
        Self {
            name: name.into(),
            route: None,
            description: None,
            source,
            target,
            auto_start: true,
            listen_port: None,
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Validate and fill defaults: trimmed name, route slug, forced target
    pub fn normalize(mut self) -> Result<Self, StudioError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(StudioError::InvalidFlow("name cannot be empty".into()));
        }

        let route = match self.route.as_deref().map(str::trim) {
            Some(route) if !route.is_empty() => route.to_string(),
            _ => slugify(&self.name),
        };
        if route.is_empty() || !route.chars().all(is_route_char) {
            return Err(StudioError::InvalidFlow(format!(
                "route '{route}' may only contain letters, digits, '-' and '_'"
            )));
        }
        self.route = Some(route);

        self.description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        match &mut self.source {
            Source::LocalCommand { command, .. } => {
                *command = command.trim().to_string();
                if command.is_empty() {
                    return Err(StudioError::InvalidFlow(
                        "a local command source needs a command".into(),
                    ));
                }
            }
            Source::Remote { url, .. } => require_http("url", url)?,
            Source::Openapi { base_url, spec_url } => {
                require_http("base_url", base_url)?;
                require_http("spec_url", spec_url)?;
                self.target = Target::StreamableHttp;
            }
        }

        if self.listen_port == Some(0) {
            return Err(StudioError::InvalidFlow("listen_port cannot be 0".into()));
        }
        Ok(self)
    }
}

fn is_route_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn require_http(field: &str, value: &mut String) -> Result<(), StudioError> {
    *value = value.trim().to_string();
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(StudioError::InvalidFlow(format!(
            "{field} must be an http(s) URL, got '{value}'"
        )))
    }
}

/// Lowercase, ASCII-only slug; runs of other characters collapse to one `-`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// A persisted flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: Source,
    pub target: Target,
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Build a new flow from a spec; the id is freshly generated
    pub fn create(spec: FlowSpec) -> Result<Self, StudioError> {
        let now = Utc::now();
        let mut flow = Flow {
            id: FlowId::generate(),
            name: String::new(),
            route: String::new(),
            description: None,
            source: spec.source.clone(),
            target: spec.target,
            auto_start: spec.auto_start,
            listen_port: None,
            created_at: now,
            updated_at: now,
        };
        flow.apply(spec)?;
        flow.updated_at = now;
        Ok(flow)
    }

    /// Replace every operator-controlled field, keeping id and creation time
    pub fn apply(&mut self, spec: FlowSpec) -> Result<(), StudioError> {
        let spec = spec.normalize()?;
        self.name = spec.name;
        self.route = spec.route.unwrap_or_default();
        self.description = spec.description;
        self.source = spec.source;
        self.target = spec.target;
        self.auto_start = spec.auto_start;
        self.listen_port = spec.listen_port;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_two_stage(&self) -> bool {
        self.source.is_two_stage()
    }
}
