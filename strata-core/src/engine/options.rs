use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Every handler of a dispatch runs regardless of earlier failures.
    #[default]
    Continue,
    /// The first failure or timeout skips the remaining handlers of that
    /// dispatch. Only honoured in synchronous mode.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorOptions {
    pub timeout_ms: u64,
    #[serde(rename = "async")]
    pub run_async: bool,
    pub error_policy: ErrorPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            run_async: false,
            error_policy: ErrorPolicy::Continue,
        }
    }
}

impl ExecutorOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// A named factory reference: `{ "type": "file", "options": { ... } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComponentOptions {
    #[serde(rename = "type")]
    pub kind: String,
    pub options: Value,
}

impl ComponentOptions {
    pub fn new(kind: impl Into<String>, options: Value) -> Self {
        Self {
            kind: kind.into(),
            options,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceOptions {
    pub name: String,
    pub provider: ComponentOptions,
    pub decoder: ComponentOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineOptions {
    /// Lowest priority first.
    pub sources: Vec<SourceOptions>,
    pub executor: ExecutorOptions,
    pub event_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            executor: ExecutorOptions::default(),
            event_buffer: 256,
        }
    }
}

impl EngineOptions {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| Error::Config(format!("failed parsing engine options json: {err}")))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| Error::Config(format!("failed parsing engine options toml: {err}")))
    }

    /// Loads options from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!(
                "failed reading engine options '{}': {err}",
                path.display()
            ))
        })?;
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or_default();
        match ext {
            "toml" => Self::from_toml_str(&raw),
            "json" => Self::from_json_str(&raw),
            other => Err(Error::Config(format!(
                "unsupported engine options format '{other}' for '{}'",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (position, source) in self.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(Error::Config(format!("source #{position} has no name")));
            }
            if self.sources[..position]
                .iter()
                .any(|other| other.name == source.name)
            {
                return Err(Error::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if source.provider.kind.trim().is_empty() || source.decoder.kind.trim().is_empty() {
                return Err(Error::Config(format!(
                    "source '{}' must name a provider type and a decoder type",
                    source.name
                )));
            }
        }
        Ok(())
    }
}
