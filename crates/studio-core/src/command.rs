use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to spawn one child process
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub program: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: BTreeMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    /// Port the process binds, if it is known up front
    #[builder(default)]
    pub port: Option<u16>,
}

impl CommandSpec {
    pub fn builder() -> CommandSpecBuilder {
        CommandSpecBuilder::default()
    }

    /// Build from a configured command line such as `uvx mcpo`
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            ..Default::default()
        })
    }

    pub fn with_args<S: ToString, I: IntoIterator<Item = S>>(mut self, iter: I) -> Self {
        self.args.extend(iter.into_iter().map(|s| s.to_string()));
        self
    }

    pub fn with_env<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Shell-like rendering for logs and previews
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl CommandSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(BTreeMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}
