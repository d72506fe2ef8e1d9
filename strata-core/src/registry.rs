use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::decoders::{Decoder, FlatDecoder, JsonDecoder, TomlDecoder, YamlDecoder};
use crate::error::{Error, Result};
use crate::providers::{ArgsProvider, EnvProvider, FileProvider, MemoryProvider, Provider};
use crate::storage::FlatOptions;

pub type ProviderFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Provider>> + Send + Sync>;
pub type DecoderFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Decoder>> + Send + Sync>;

/// Type-name to constructor tables used by
/// [`ConfigEngine::from_options`](crate::engine::ConfigEngine::from_options).
///
/// `Registry::default()` knows the bundled providers (`memory`, `file`, `env`,
/// `args`) and decoders (`json`, `yaml`, `toml`, `flat`).
#[derive(Clone)]
pub struct Registry {
    providers: HashMap<String, ProviderFactory>,
    decoders: HashMap<String, DecoderFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_builtin_providers();
        registry.register_builtin_decoders();
        registry
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            decoders: HashMap::new(),
        }
    }

    pub fn register_provider<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        self.providers.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_decoder<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Decoder>> + Send + Sync + 'static,
    {
        self.decoders.insert(kind.into(), Arc::new(factory));
    }

    pub fn create_provider(&self, kind: &str, options: &Value) -> Result<Arc<dyn Provider>> {
        let factory = self
            .providers
            .get(kind)
            .ok_or_else(|| Error::Config(format!("unknown provider type '{kind}'")))?;
        factory(options)
    }

    pub fn create_decoder(&self, kind: &str, options: &Value) -> Result<Arc<dyn Decoder>> {
        let factory = self
            .decoders
            .get(kind)
            .ok_or_else(|| Error::Config(format!("unknown decoder type '{kind}'")))?;
        factory(options)
    }

    pub fn provider_types(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn decoder_types(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    fn register_builtin_providers(&mut self) {
        self.register_provider("memory", |options| {
            let parsed: MemoryOptions = parse_options("memory", options)?;
            Ok(Arc::new(MemoryProvider::new(parsed.name, parsed.content)) as Arc<dyn Provider>)
        });
        self.register_provider("file", |options| {
            let parsed: FileOptions = parse_options("file", options)?;
            let path = parsed
                .path
                .filter(|path| !path.trim().is_empty())
                .ok_or_else(|| Error::Config("file provider requires 'path'".to_owned()))?;
            let provider = FileProvider::new(path)
                .with_poll_interval(Duration::from_millis(parsed.poll_interval_ms))
                .optional(parsed.optional);
            Ok(Arc::new(provider) as Arc<dyn Provider>)
        });
        self.register_provider("env", |options| {
            let parsed: EnvOptions = parse_options("env", options)?;
            Ok(Arc::new(EnvProvider::new(parsed.prefix)) as Arc<dyn Provider>)
        });
        self.register_provider("args", |options| {
            let parsed: ArgsOptions = parse_options("args", options)?;
            let args = parsed
                .args
                .unwrap_or_else(|| std::env::args().skip(1).collect());
            Ok(Arc::new(ArgsProvider::new(args)) as Arc<dyn Provider>)
        });
    }

    fn register_builtin_decoders(&mut self) {
        self.register_decoder("json", |_| Ok(Arc::new(JsonDecoder) as Arc<dyn Decoder>));
        self.register_decoder("yaml", |_| Ok(Arc::new(YamlDecoder) as Arc<dyn Decoder>));
        self.register_decoder("toml", |_| Ok(Arc::new(TomlDecoder) as Arc<dyn Decoder>));
        self.register_decoder("flat", |options| {
            let parsed: FlatOptions = parse_options("flat", options)?;
            Ok(Arc::new(FlatDecoder::new(parsed)) as Arc<dyn Decoder>)
        });
    }
}

fn parse_options<T: DeserializeOwned + Default>(kind: &str, options: &Value) -> Result<T> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone())
        .map_err(|err| Error::Config(format!("invalid options for '{kind}': {err}")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemoryOptions {
    name: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FileOptions {
    path: Option<String>,
    poll_interval_ms: u64,
    optional: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: 1_000,
            optional: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOptions {
    prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArgsOptions {
    args: Option<Vec<String>>,
}
