use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use super::{ConfigEngine, EngineOptions, ErrorPolicy, ExecutorOptions};
use crate::decoders::{Decoder, FlatDecoder, JsonDecoder, YamlDecoder};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::providers::{ChangeCallback, FileProvider, MemoryProvider, Provider};
use crate::registry::Registry;
use crate::storage::{Storage, TreeStorage};

fn memory(name: &str, content: &str) -> Arc<MemoryProvider> {
    Arc::new(MemoryProvider::new(name, content))
}

async fn json_engine(layers: &[(&str, &Arc<MemoryProvider>)]) -> ConfigEngine {
    let mut builder = ConfigEngine::builder();
    for (name, provider) in layers {
        let provider = Arc::clone(*provider) as Arc<dyn Provider>;
        builder = builder.source(*name, provider, Arc::new(JsonDecoder));
    }
    builder.build().await.expect("engine builds")
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct Database {
    host: String,
    port: u16,
}

/// Wraps a memory provider and counts `close` calls, failing the first one.
struct CountingProvider {
    inner: MemoryProvider,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Provider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    async fn load(&self) -> Result<Vec<u8>> {
        self.inner.load().await
    }

    async fn save(&self, bytes: &[u8]) -> Result<()> {
        self.inner.save(bytes).await
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.inner.on_change(callback);
    }

    async fn watch(&self) -> Result<()> {
        self.inner.watch().await
    }

    async fn close(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::Config("socket already gone".to_owned()))
        } else {
            Ok(())
        }
    }
}

/// Memory provider whose first `watch` call fails.
struct FlakyWatchProvider {
    inner: Arc<MemoryProvider>,
    attempts: AtomicUsize,
}

#[async_trait]
impl Provider for FlakyWatchProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn load(&self) -> Result<Vec<u8>> {
        self.inner.load().await
    }

    async fn save(&self, bytes: &[u8]) -> Result<()> {
        self.inner.save(bytes).await
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.inner.on_change(callback);
    }

    async fn watch(&self) -> Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::SourceLoad("watcher not ready".to_owned()));
        }
        self.inner.watch().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Hands out the same storage on every decode.
struct FixedDecoder {
    storage: Arc<dyn Storage>,
}

impl Decoder for FixedDecoder {
    fn name(&self) -> &str {
        "fixed"
    }

    fn decode(&self, _bytes: &[u8]) -> Result<Arc<dyn Storage>> {
        Ok(Arc::clone(&self.storage))
    }

    fn encode(&self, _storage: &dyn Storage) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

fn counter_on(engine: &ConfigEngine, path: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    engine
        .on_key_change(path, move |_storage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("register");
    calls
}

#[tokio::test]
async fn later_sources_win_per_key() {
    let base = memory("base", r#"{"a": 1, "b": 1}"#);
    let local = memory("local", r#"{"b": 2, "c": 2}"#);
    let engine = json_engine(&[("base", &base), ("local", &local)]).await;

    assert_eq!(engine.value("").expect("merged"), json!({"a": 1, "b": 2, "c": 2}));
    assert_eq!(engine.get::<i64>("b").expect("b"), 2);
    assert_eq!(engine.source_names(), vec!["base", "local"]);
}

#[tokio::test]
async fn empty_sub_path_is_the_same_node() {
    let provider = memory("mem", r#"{"db": {"host": "h"}}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    assert!(engine.sub("").ptr_eq(&engine));
    let db = engine.sub("db");
    assert!(db.sub("").ptr_eq(&db));
    assert!(!db.is_root());
    assert_eq!(db.full_path().to_string(), "db");
    assert_eq!(db.get::<String>("host").expect("host"), "h");
}

#[tokio::test]
async fn sub_nodes_bind_relative_to_their_path() {
    let provider = memory("mem", r#"{"services": {"db": {"host": "a", "port": 5432}}}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    let db: Database = engine.sub("services").sub("db").convert().expect("binds");
    assert_eq!(db, Database { host: "a".to_owned(), port: 5432 });

    let mut partial = Database { host: "keep".to_owned(), port: 1 };
    provider.set(r#"{"services": {"db": {"port": 6000}}}"#);
    engine.reload().await.expect("reload");
    engine
        .sub("services.db")
        .convert_into(&mut partial)
        .expect("binds");
    assert_eq!(partial, Database { host: "keep".to_owned(), port: 6000 });
}

#[tokio::test]
async fn handlers_fire_only_for_changed_paths() {
    let provider = memory("mem", r#"{"db": {"host": "a"}, "cache": {"ttl": 5}}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    let fired = Arc::new(Mutex::new(Vec::new()));
    for path in ["", "db", "cache"] {
        let log = Arc::clone(&fired);
        engine
            .on_key_change(path, move |_storage| {
                log.lock().push(path);
                Ok(())
            })
            .expect("register");
    }

    provider.set(r#"{"db": {"host": "b"}, "cache": {"ttl": 5}}"#);
    let reports = engine.reload().await.expect("reload");

    let paths: Vec<&str> = reports.iter().map(|report| report.path.as_str()).collect();
    assert_eq!(paths, vec!["", "db"]);
    let mut seen = fired.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec!["", "db"]);
}

#[tokio::test]
async fn handler_receives_the_view_at_its_path() {
    let provider = memory("mem", r#"{"db": {"host": "a", "port": 1}}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .sub("db")
        .on_change(move |storage: &dyn Storage| {
            let db: Database = storage.convert()?;
            let _ = tx.send(db);
            Ok(())
        })
        .expect("register");

    provider.set(r#"{"db": {"host": "b", "port": 2}}"#);
    engine.reload().await.expect("reload");

    let db = rx.recv().await.expect("handler ran");
    assert_eq!(db, Database { host: "b".to_owned(), port: 2 });
}

#[tokio::test]
async fn watch_picks_up_changes_made_before_it() {
    let provider = memory("mem", r#"{"level": "info"}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    engine
        .on_key_change("level", move |_storage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("register");

    provider.set(r#"{"level": "debug"}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    engine.watch().await.expect("watch");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.get::<String>("level").expect("level"), "debug");

    engine.watch().await.expect("second watch is a no-op");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn watched_changes_are_dispatched_by_the_update_loop() {
    let provider = memory("mem", r#"{"port": 1}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .on_key_change("port", move |storage: &dyn Storage| {
            let port: u16 = storage.convert()?;
            let _ = tx.send(port);
            Ok(())
        })
        .expect("register");
    engine.watch().await.expect("watch");

    provider.set(r#"{"port": 2}"#);
    provider.set(r#"{"port": 3}"#);

    let mut last = 0;
    while last != 3 {
        last = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("dispatch in time")
            .expect("channel open");
    }
    engine.close().await.expect("close");
}

#[tokio::test]
async fn failed_reload_keeps_previous_snapshot() {
    let provider = memory("mem", r#"{"a": 1}"#);
    let engine = json_engine(&[("mem", &provider)]).await;
    let mut events = engine.events();

    provider.set("{ not json");
    let reports = engine.reload().await.expect("reload itself succeeds");

    assert!(reports.is_empty());
    assert_eq!(engine.get::<i64>("a").expect("a"), 1);
    match events.recv().await.expect("event") {
        Event::SourceFailed { source, error } => {
            assert_eq!(source, "mem");
            assert!(error.contains("source 'mem'"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn stop_policy_skips_remaining_handlers() {
    let provider = memory("mem", r#"{"a": 1}"#);
    let engine = ConfigEngine::builder()
        .source("mem", Arc::clone(&provider) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .executor(ExecutorOptions {
            error_policy: ErrorPolicy::Stop,
            ..ExecutorOptions::default()
        })
        .build()
        .await
        .expect("engine builds");

    let ran = Arc::new(Mutex::new(Vec::new()));
    for (index, fail) in [(0, false), (1, true), (2, false)] {
        let log = Arc::clone(&ran);
        engine
            .on_change(move |_storage| {
                log.lock().push(index);
                if fail {
                    Err(Error::Config("rejected".to_owned()))
                } else {
                    Ok(())
                }
            })
            .expect("register");
    }

    provider.set(r#"{"a": 2}"#);
    let reports = engine.reload().await.expect("reload");

    assert_eq!(*ran.lock(), vec![0, 1]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].skipped, 1);
}

#[tokio::test]
async fn continue_policy_runs_every_handler() {
    let provider = memory("mem", r#"{"a": 1}"#);
    let engine = json_engine(&[("mem", &provider)]).await;

    let ran = Arc::new(AtomicUsize::new(0));
    for fail in [true, false, true] {
        let counter = Arc::clone(&ran);
        engine
            .on_change(move |_storage| {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::Config("rejected".to_owned()))
                } else {
                    Ok(())
                }
            })
            .expect("register");
    }

    provider.set(r#"{"a": 2}"#);
    let reports = engine.reload().await.expect("reload");

    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(reports[0].failures().count(), 2);
    assert_eq!(reports[0].skipped, 0);
}

#[tokio::test]
async fn slow_handler_reports_exactly_one_timeout() {
    let provider = memory("mem", r#"{"a": 1}"#);
    let timeouts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&timeouts);
    let engine = ConfigEngine::builder()
        .source("mem", Arc::clone(&provider) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .executor(ExecutorOptions {
            timeout_ms: 50,
            ..ExecutorOptions::default()
        })
        .observer(move |record| {
            if record.outcome.is_timeout() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .await
        .expect("engine builds");

    engine
        .on_change(|_storage| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .expect("register");

    provider.set(r#"{"a": 2}"#);
    let reports = engine.reload().await.expect("reload");

    assert_eq!(reports[0].timeouts(), 1);
    assert_eq!(reports[0].records.len(), 1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn async_mode_runs_all_handlers_despite_stop() {
    let provider = memory("mem", r#"{"a": 1}"#);
    let engine = ConfigEngine::builder()
        .source("mem", Arc::clone(&provider) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .executor(ExecutorOptions {
            run_async: true,
            error_policy: ErrorPolicy::Stop,
            ..ExecutorOptions::default()
        })
        .build()
        .await
        .expect("engine builds");

    let ran = Arc::new(AtomicUsize::new(0));
    for fail in [true, false] {
        let counter = Arc::clone(&ran);
        engine
            .on_change(move |_storage| {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::Config("rejected".to_owned()))
                } else {
                    Ok(())
                }
            })
            .expect("register");
    }

    provider.set(r#"{"a": 2}"#);
    let reports = engine.reload().await.expect("reload");

    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert_eq!(reports[0].skipped, 0);
}

#[tokio::test]
async fn concurrent_close_tears_down_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let provider = CountingProvider {
        inner: MemoryProvider::new("mem", r#"{"a": 1}"#),
        closes: Arc::clone(&closes),
    };
    let engine = ConfigEngine::builder()
        .source("counting", Arc::new(provider) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .build()
        .await
        .expect("engine builds");

    let other = engine.sub("a");
    let (first, second) = tokio::join!(engine.close(), other.close());

    let expected = Err(Error::Config("socket already gone".to_owned()));
    assert_eq!(first, expected);
    assert_eq!(second, expected);
    assert_eq!(engine.close().await, expected);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn operations_after_close_fail() {
    let provider = memory("mem", r#"{"a": 1}"#);
    let engine = json_engine(&[("mem", &provider)]).await;
    engine.close().await.expect("close");

    assert!(engine.is_closed());
    assert_eq!(engine.get::<i64>("a"), Err(Error::EngineClosed));
    assert_eq!(engine.sub("a").value(""), Err(Error::EngineClosed));
    assert_eq!(engine.on_change(|_storage| Ok(())), Err(Error::EngineClosed));
    assert_eq!(engine.watch().await, Err(Error::EngineClosed));
    assert!(matches!(engine.reload().await, Err(Error::EngineClosed)));
    engine.close().await.expect("close is idempotent");
}

#[tokio::test]
async fn resolve_reports_each_layer() {
    let base = memory("base", r#"{"db": {"host": "a", "port": 1}}"#);
    let local = memory("local", r#"{"db": {"host": "b"}}"#);
    let engine = json_engine(&[("base", &base), ("local", &local)]).await;

    let resolved = engine.resolve("db.host").expect("resolves");
    assert_eq!(resolved.effective, json!("b"));
    assert_eq!(resolved.source.as_deref(), Some("local"));
    assert_eq!(
        resolved.layers,
        vec![
            ("base".to_owned(), Some(json!("a"))),
            ("local".to_owned(), Some(json!("b"))),
        ]
    );

    let port = engine.sub("db").resolve("port").expect("resolves");
    assert_eq!(port.path, "db.port");
    assert_eq!(port.source.as_deref(), Some("base"));

    assert!(matches!(engine.value("db.user"), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn duplicate_source_names_are_rejected() {
    let result = ConfigEngine::builder()
        .source("same", memory("a", "{}") as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .source("same", memory("b", "{}") as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .build()
        .await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn construction_fails_on_undecodable_source() {
    let result = ConfigEngine::builder()
        .source("broken", memory("broken", "[1,") as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .build()
        .await;
    match result {
        Err(Error::Decode(message)) => assert!(message.starts_with("source 'broken': ")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn options_build_sources_through_the_registry() {
    let options = EngineOptions::from_json_str(
        &json!({
            "executor": { "timeout_ms": 1000, "error_policy": "stop" },
            "sources": [
                {
                    "name": "defaults",
                    "provider": { "type": "memory", "options": { "content": "{\"server\": {\"port\": 8080, \"host\": \"0.0.0.0\"}}" } },
                    "decoder": { "type": "json" }
                },
                {
                    "name": "overrides",
                    "provider": { "type": "memory", "options": { "content": "server.port=9090\n" } },
                    "decoder": { "type": "flat" }
                }
            ]
        })
        .to_string(),
    )
    .expect("options parse");

    let engine = ConfigEngine::from_options(&options, &Registry::default())
        .await
        .expect("engine builds");

    assert_eq!(engine.get::<u16>("server.port").expect("port"), 9090);
    assert_eq!(engine.get::<String>("server.host").expect("host"), "0.0.0.0");
}

#[tokio::test]
async fn flat_overrides_bind_into_typed_sequences() {
    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Cluster {
        name: String,
        replicas: Vec<String>,
    }

    let base = memory("base", r#"{"cluster": {"name": "main", "replicas": ["a", "b", "c"]}}"#);
    let env = memory("env", "CLUSTER_REPLICAS=x, y\n");
    let engine = ConfigEngine::builder()
        .source("base", Arc::clone(&base) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .source(
            "env",
            Arc::clone(&env) as Arc<dyn Provider>,
            Arc::new(FlatDecoder::new(crate::storage::FlatOptions::env())),
        )
        .build()
        .await
        .expect("engine builds");

    let cluster: Cluster = engine.get("cluster").expect("binds");
    assert_eq!(
        cluster,
        Cluster {
            name: "main".to_owned(),
            replicas: vec!["x".to_owned(), "y".to_owned()],
        }
    );
}

#[tokio::test]
async fn file_source_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("app.yaml");
    std::fs::write(&path, "db:\n  host: a\n  port: 1\n").expect("seed file");

    let provider = FileProvider::new(path.clone()).with_poll_interval(Duration::from_millis(20));
    let engine = ConfigEngine::builder()
        .source("file", Arc::new(provider) as Arc<dyn Provider>, Arc::new(YamlDecoder))
        .build()
        .await
        .expect("engine builds");

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .on_key_change("db", move |storage: &dyn Storage| {
            let db: Database = storage.convert()?;
            let _ = tx.send(db);
            Ok(())
        })
        .expect("register");
    engine.watch().await.expect("watch");

    std::fs::write(&path, "db:\n  host: b\n  port: 2\n").expect("rewrite");
    let db = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("change detected")
        .expect("channel open");
    assert_eq!(db, Database { host: "b".to_owned(), port: 2 });

    engine.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_dispatch_each_change_once() {
    let first = memory("first", r#"{"a": 0}"#);
    let second = memory("second", r#"{"b": 0}"#);
    let engine = json_engine(&[("first", &first), ("second", &second)]).await;
    let a_calls = counter_on(&engine, "a");
    let b_calls = counter_on(&engine, "b");

    for round in 1..=25 {
        first.set(format!(r#"{{"a": {round}}}"#));
        second.set(format!(r#"{{"b": {round}}}"#));
        let left = tokio::spawn({
            let engine = engine.clone();
            async move { engine.refresh(0).await }
        });
        let right = tokio::spawn({
            let engine = engine.clone();
            async move { engine.refresh(1).await }
        });
        let left = left.await.expect("task").expect("first refresh");
        let right = right.await.expect("task").expect("second refresh");
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 1);
        assert_eq!(a_calls.load(Ordering::SeqCst), round);
        assert_eq!(b_calls.load(Ordering::SeqCst), round);
    }
}

#[tokio::test]
async fn watch_can_be_retried_after_a_provider_fails_to_start() {
    let steady = memory("steady", r#"{"a": 1}"#);
    let inner = memory("inner", r#"{"b": 1}"#);
    let flaky = FlakyWatchProvider {
        inner: Arc::clone(&inner),
        attempts: AtomicUsize::new(0),
    };
    let engine = ConfigEngine::builder()
        .source("steady", Arc::clone(&steady) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .source("flaky", Arc::new(flaky) as Arc<dyn Provider>, Arc::new(JsonDecoder))
        .build()
        .await
        .expect("engine builds");

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine
        .on_key_change("b", move |storage: &dyn Storage| {
            let b: i64 = storage.convert()?;
            let _ = tx.send(b);
            Ok(())
        })
        .expect("register");

    assert!(matches!(engine.watch().await, Err(Error::SourceLoad(_))));
    engine.watch().await.expect("retry starts the remaining provider");

    inner.set(r#"{"b": 2}"#);
    let b = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("dispatch in time")
        .expect("channel open");
    assert_eq!(b, 2);
    engine.close().await.expect("close");
}

#[tokio::test]
async fn reused_storage_is_reported_as_a_failed_update() {
    let provider = memory("mem", "{}");
    let decoder = FixedDecoder {
        storage: TreeStorage::new(json!({ "a": 1 })).into_shared(),
    };
    let engine = ConfigEngine::builder()
        .source("fixed", provider as Arc<dyn Provider>, Arc::new(decoder))
        .build()
        .await
        .expect("engine builds");
    let mut events = engine.events();

    let reports = engine.reload().await.expect("reload itself succeeds");

    assert!(reports.is_empty());
    assert_eq!(engine.get::<i64>("a").expect("a"), 1);
    match events.recv().await.expect("event") {
        Event::SourceFailed { source, error } => {
            assert_eq!(source, "fixed");
            assert!(error.contains("already in use"), "{error}");
        }
        other => panic!("unexpected event {other:?}"),
    }
}
