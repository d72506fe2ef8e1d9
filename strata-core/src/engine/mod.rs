pub mod executor;
pub mod options;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;

use crate::decoders::Decoder;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::providers::Provider;
use crate::registry::Registry;
use crate::storage::multi::same_storage;
use crate::storage::{ConfigPath, MultiStorage, Storage};

pub use executor::{
    handler, DispatchReport, Handler, HandlerExecutor, HandlerRecord, Observer, Outcome,
};
pub use options::{ComponentOptions, EngineOptions, ErrorPolicy, ExecutorOptions, SourceOptions};

/// One configuration layer: where bytes come from, how they are decoded and
/// the snapshot currently in effect.
struct Source {
    name: String,
    provider: Arc<dyn Provider>,
    decoder: Arc<dyn Decoder>,
    storage: RwLock<Arc<dyn Storage>>,
    update_lock: tokio::sync::Mutex<()>,
}

struct Root {
    sources: Vec<Source>,
    handlers: RwLock<BTreeMap<String, Vec<Handler>>>,
    executor: HandlerExecutor,
    events: EventBus,
    closed: AtomicBool,
    watching: tokio::sync::Mutex<bool>,
    /// Serializes snapshot swaps across sources so each diff sees only its
    /// own source's change.
    swap_lock: Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_result: OnceCell<Result<()>>,
}

enum Node {
    Root(Root),
    Sub { parent: ConfigEngine, key: ConfigPath },
}

/// Where the effective value at a path comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedValue {
    pub path: String,
    pub effective: Value,
    /// Highest-priority source that defines the path.
    pub source: Option<String>,
    /// Every source's own value, lowest priority first.
    pub layers: Vec<(String, Option<Value>)>,
}

/// Handle on the merged configuration, either the root or a sub node rooted at
/// a path below it. Clones share the node; every node forwards to the one root
/// that owns the sources and the handler registry.
#[derive(Clone)]
pub struct ConfigEngine {
    node: Arc<Node>,
}

pub struct EngineBuilder {
    sources: Vec<(String, Arc<dyn Provider>, Arc<dyn Decoder>)>,
    executor: ExecutorOptions,
    observer: Option<Observer>,
    event_buffer: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            executor: ExecutorOptions::default(),
            observer: None,
            event_buffer: EngineOptions::default().event_buffer,
        }
    }
}

impl EngineBuilder {
    /// Adds a source above every source added so far.
    pub fn source(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        self.sources.push((name.into(), provider, decoder));
        self
    }

    pub fn executor(mut self, options: ExecutorOptions) -> Self {
        self.executor = options;
        self
    }

    /// Called with every handler outcome, after it is logged.
    pub fn observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&HandlerRecord) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Loads and decodes every source. Any failure aborts construction.
    pub async fn build(self) -> Result<ConfigEngine> {
        let events = EventBus::new(self.event_buffer);
        let mut executor = HandlerExecutor::new(&self.executor).with_events(events.clone());
        if let Some(observer) = self.observer {
            executor = executor.with_observer(observer);
        }

        let mut sources: Vec<Source> = Vec::with_capacity(self.sources.len());
        for (name, provider, decoder) in self.sources {
            if sources.iter().any(|source| source.name == name) {
                return Err(Error::Config(format!("duplicate source name '{name}'")));
            }
            let storage = load_source(&name, provider.as_ref(), decoder.as_ref()).await?;
            if sources
                .iter()
                .any(|source| same_storage(&source.storage.read(), &storage))
            {
                return Err(Error::Config(format!(
                    "decoder for source '{name}' returned a storage already in use"
                )));
            }
            tracing::debug!(
                source = %name,
                provider = provider.name(),
                decoder = decoder.name(),
                "config source loaded"
            );
            sources.push(Source {
                name,
                provider,
                decoder,
                storage: RwLock::new(storage),
                update_lock: tokio::sync::Mutex::new(()),
            });
        }

        let engine = ConfigEngine {
            node: Arc::new(Node::Root(Root {
                sources,
                handlers: RwLock::new(BTreeMap::new()),
                executor,
                events,
                closed: AtomicBool::new(false),
                watching: tokio::sync::Mutex::new(false),
                swap_lock: Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                close_result: OnceCell::new(),
            })),
        };
        engine.spawn_update_loops();
        Ok(engine)
    }
}

async fn load_source(
    name: &str,
    provider: &dyn Provider,
    decoder: &dyn Decoder,
) -> Result<Arc<dyn Storage>> {
    let bytes = provider.load().await.map_err(|err| match err {
        Error::SourceLoad(message) => Error::SourceLoad(format!("source '{name}': {message}")),
        other => other,
    })?;
    decoder.decode(&bytes).map_err(|err| match err {
        Error::Decode(message) => Error::Decode(format!("source '{name}': {message}")),
        other => other,
    })
}

/// Serializes one source's notifications: each is handled to completion,
/// dispatch included, before the next is read.
async fn update_loop(
    node: Weak<Node>,
    index: usize,
    mut notifications: mpsc::UnboundedReceiver<()>,
) {
    while notifications.recv().await.is_some() {
        let Some(node) = node.upgrade() else {
            break;
        };
        let engine = ConfigEngine { node };
        if engine.is_closed() {
            break;
        }
        // Failures are logged and published by refresh; the loop keeps going.
        let _ = engine.refresh(index).await;
    }
}

impl Root {
    fn merged(&self) -> Arc<dyn Storage> {
        let members = self
            .sources
            .iter()
            .map(|source| source.storage.read().clone())
            .collect();
        MultiStorage::from_distinct(members).into_shared()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::EngineClosed)
        } else {
            Ok(())
        }
    }

    async fn teardown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let mut first_error: Option<Error> = None;
        for source in &self.sources {
            if let Err(err) = source.provider.close().await {
                tracing::warn!(source = %source.name, %err, "failed closing config provider");
                first_error.get_or_insert(err);
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        self.events.publish(Event::Closed {
            error: first_error.as_ref().map(ToString::to_string),
        });
        tracing::debug!(failed = first_error.is_some(), "config engine closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ConfigEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Builds an engine whose sources are created by `registry` from their
    /// type names.
    pub async fn from_options(options: &EngineOptions, registry: &Registry) -> Result<Self> {
        options.validate()?;
        let mut builder = Self::builder()
            .executor(options.executor.clone())
            .event_buffer(options.event_buffer);
        for source in &options.sources {
            let provider =
                registry.create_provider(&source.provider.kind, &source.provider.options)?;
            let decoder = registry.create_decoder(&source.decoder.kind, &source.decoder.options)?;
            builder = builder.source(source.name.clone(), provider, decoder);
        }
        builder.build().await
    }

    fn root(&self) -> &Root {
        let mut node = self.node.as_ref();
        loop {
            match node {
                Node::Root(root) => return root,
                Node::Sub { parent, .. } => node = parent.node.as_ref(),
            }
        }
    }

    fn root_engine(&self) -> ConfigEngine {
        match self.node.as_ref() {
            Node::Root(_) => self.clone(),
            Node::Sub { parent, .. } => parent.root_engine(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.node.as_ref(), Node::Root(_))
    }

    /// `true` when both handles are the same node.
    pub fn ptr_eq(&self, other: &ConfigEngine) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn full_path(&self) -> ConfigPath {
        match self.node.as_ref() {
            Node::Root(_) => ConfigPath::root(),
            Node::Sub { parent, key } => parent.full_path().join(key),
        }
    }

    /// Node rooted at `path` below this one. An empty path returns this node.
    pub fn sub(&self, path: &str) -> ConfigEngine {
        let key = ConfigPath::parse(path);
        if key.is_root() {
            return self.clone();
        }
        ConfigEngine {
            node: Arc::new(Node::Sub {
                parent: self.clone(),
                key,
            }),
        }
    }

    /// Current merged view at this node, recomputed from the sources' latest
    /// snapshots.
    pub fn storage(&self) -> Arc<dyn Storage> {
        let merged = self.root().merged();
        let path = self.full_path();
        if path.is_root() {
            merged
        } else {
            merged.sub_path(&path)
        }
    }

    pub fn convert<T>(&self) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.root().ensure_open()?;
        self.storage().convert()
    }

    pub fn convert_into<T>(&self, dest: &mut T) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        self.root().ensure_open()?;
        self.storage().convert_into(dest)
    }

    pub fn get<T>(&self, path: &str) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.sub(path).convert()
    }

    /// Untyped value at `path`, `NotFound` when no source defines it.
    pub fn value(&self, path: &str) -> Result<Value> {
        self.root().ensure_open()?;
        let node = self.sub(path);
        node.storage().to_value().ok_or_else(|| {
            Error::NotFound(format!("path '{}' is not set by any source", node.full_path()))
        })
    }

    /// The effective value at `path` together with each layer's contribution.
    pub fn resolve(&self, path: &str) -> Result<ResolvedValue> {
        let effective = self.value(path)?;
        let full = self.sub(path).full_path();
        let layers: Vec<(String, Option<Value>)> = self
            .root()
            .sources
            .iter()
            .map(|source| {
                let storage = source.storage.read().clone();
                (source.name.clone(), storage.sub_path(&full).to_value())
            })
            .collect();
        let source = layers
            .iter()
            .rev()
            .find(|(_, value)| value.is_some())
            .map(|(name, _)| name.clone());
        Ok(ResolvedValue {
            path: full.to_string(),
            effective,
            source,
            layers,
        })
    }

    /// Encodes the merged view at this node.
    pub fn dump(&self, decoder: &dyn Decoder) -> Result<Vec<u8>> {
        self.root().ensure_open()?;
        decoder.encode(self.storage().as_ref())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.root()
            .sources
            .iter()
            .map(|source| source.name.clone())
            .collect()
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.root().events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.root().closed.load(Ordering::SeqCst)
    }

    /// Registers `callback` for changes anywhere below this node.
    pub fn on_change<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&dyn Storage) -> Result<()> + Send + Sync + 'static,
    {
        self.register(self.full_path(), handler(callback))
    }

    /// Registers `callback` for changes below `path`, relative to this node.
    pub fn on_key_change<F>(&self, path: &str, callback: F) -> Result<()>
    where
        F: Fn(&dyn Storage) -> Result<()> + Send + Sync + 'static,
    {
        self.register(self.full_path().join(&ConfigPath::parse(path)), handler(callback))
    }

    /// Registers a handler that receives the cancellation token of its
    /// invocation.
    pub fn on_key_change_with(&self, path: &str, callback: Handler) -> Result<()> {
        self.register(self.full_path().join(&ConfigPath::parse(path)), callback)
    }

    fn register(&self, path: ConfigPath, callback: Handler) -> Result<()> {
        let root = self.root();
        root.ensure_open()?;
        let key = path.to_string();
        tracing::debug!(path = %key, "config handler registered");
        root.handlers.write().entry(key).or_default().push(callback);
        Ok(())
    }

    fn spawn_update_loops(&self) {
        let root = self.root();
        let mut tasks = root.tasks.lock();
        for (index, source) in root.sources.iter().enumerate() {
            let (sender, receiver) = mpsc::unbounded_channel();
            source.provider.on_change(Arc::new(move || {
                let _ = sender.send(());
            }));
            tasks.push(tokio::spawn(update_loop(
                Arc::downgrade(&self.node),
                index,
                receiver,
            )));
        }
    }

    /// Starts change delivery on every provider, then runs one refresh per
    /// source so changes made before this call are not lost. Later calls are
    /// no-ops.
    ///
    /// If a provider fails to start, the providers before it stay started and
    /// their changes keep being dispatched. Call `watch` again to retry; it
    /// only needs the failed providers to come up.
    pub async fn watch(&self) -> Result<()> {
        let engine = self.root_engine();
        let root = engine.root();
        root.ensure_open()?;

        let mut watching = root.watching.lock().await;
        if *watching {
            return Ok(());
        }
        for source in &root.sources {
            source.provider.watch().await.map_err(|err| {
                tracing::warn!(source = %source.name, %err, "failed starting config provider");
                err
            })?;
        }
        *watching = true;
        drop(watching);

        root.events.publish(Event::Watching);
        for index in 0..root.sources.len() {
            let _ = engine.refresh(index).await;
        }
        Ok(())
    }

    /// Reloads every source now and dispatches what changed. Sources that
    /// fail to load keep their previous snapshot.
    pub async fn reload(&self) -> Result<Vec<DispatchReport>> {
        let engine = self.root_engine();
        engine.root().ensure_open()?;
        let mut reports = Vec::new();
        for index in 0..engine.root().sources.len() {
            if let Ok(mut dispatched) = engine.refresh(index).await {
                reports.append(&mut dispatched);
            }
        }
        Ok(reports)
    }

    /// Load, decode, swap, diff and dispatch for one source, holding that
    /// source's update lock throughout.
    async fn refresh(&self, index: usize) -> Result<Vec<DispatchReport>> {
        let root = self.root();
        let source = root
            .sources
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("no config source at index {index}")))?;
        let _guard = source.update_lock.lock().await;
        root.ensure_open()?;

        let loaded = load_source(
            &source.name,
            source.provider.as_ref(),
            source.decoder.as_ref(),
        )
        .await;
        let fresh = match loaded {
            Ok(fresh) => fresh,
            Err(err) => {
                tracing::warn!(source = %source.name, %err, "config source update failed");
                root.events.publish(Event::SourceFailed {
                    source: source.name.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        };
        let (before, after) = {
            let _swap = root.swap_lock.lock();
            if root
                .sources
                .iter()
                .any(|other| same_storage(&other.storage.read(), &fresh))
            {
                let err = Error::Config(format!(
                    "decoder for source '{}' returned a storage already in use",
                    source.name
                ));
                tracing::warn!(source = %source.name, %err, "config source update rejected");
                root.events.publish(Event::SourceFailed {
                    source: source.name.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }

            let before = root.merged();
            *source.storage.write() = fresh;
            (before, root.merged())
        };

        let registered: Vec<(String, Vec<Handler>)> = root
            .handlers
            .read()
            .iter()
            .map(|(path, handlers)| (path.clone(), handlers.clone()))
            .collect();

        let mut changed = Vec::new();
        for (path, handlers) in registered {
            let parsed = ConfigPath::parse(&path);
            let next = after.sub_path(&parsed);
            if !before.sub_path(&parsed).equals(next.as_ref()) {
                changed.push((path, handlers, next));
            }
        }

        tracing::debug!(
            source = %source.name,
            changed = changed.len(),
            "config source updated"
        );
        root.events.publish(Event::SourceUpdated {
            source: source.name.clone(),
            changed_paths: changed.iter().map(|(path, _, _)| path.clone()).collect(),
        });

        let mut reports = Vec::with_capacity(changed.len());
        for (path, handlers, view) in changed {
            reports.push(root.executor.dispatch(&path, &handlers, view).await);
        }
        Ok(reports)
    }

    /// Closes every provider in source order. The first call runs teardown;
    /// every call, concurrent or later, returns that same result.
    pub async fn close(&self) -> Result<()> {
        let root = self.root();
        root.close_result
            .get_or_init(|| root.teardown())
            .await
            .clone()
    }
}

impl fmt::Debug for ConfigEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigEngine")
            .field("path", &self.full_path().to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}
