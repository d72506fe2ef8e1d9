use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::providers::{ChangeCallback, ChangeNotifier, Provider};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileFingerprint {
    size: u64,
    modified_epoch_millis: u128,
    sha256: String,
}

/// Reads one file. While watched, a polling task fingerprints it (size, mtime,
/// content hash) every `poll_interval` and notifies when the fingerprint moves.
pub struct FileProvider {
    name: String,
    path: PathBuf,
    poll_interval: Duration,
    optional: bool,
    notifier: Arc<ChangeNotifier>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
            poll_interval: DEFAULT_POLL_INTERVAL,
            optional: false,
            notifier: Arc::new(ChangeNotifier::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// A missing optional file loads as empty bytes instead of failing.
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn fingerprint(path: &Path) -> Option<FileFingerprint> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let content = tokio::fs::read(path).await.ok()?;
    let modified_epoch_millis = metadata
        .modified()
        .ok()
        .and_then(|value| value.duration_since(UNIX_EPOCH).ok())
        .map(|value| value.as_millis())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Some(FileFingerprint {
        size: metadata.len(),
        modified_epoch_millis,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

impl Drop for FileProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Vec<u8>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if self.optional && err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "optional config file is missing");
                Ok(Vec::new())
            }
            Err(err) => Err(Error::SourceLoad(format!(
                "failed reading '{}': {err}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, bytes: &[u8]) -> Result<()> {
        let write_error = |err: std::io::Error| {
            Error::SourceLoad(format!("failed writing '{}': {err}", self.path.display()))
        };

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let tmp_path = temp_path(&self.path);
        {
            let mut file = tokio::fs::File::create(&tmp_path).await.map_err(write_error)?;
            file.write_all(bytes).await.map_err(write_error)?;
            file.sync_all().await.map_err(write_error)?;
        }
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.notifier.register(callback);
    }

    async fn watch(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Config(format!(
                "file provider '{}' is closed",
                self.path.display()
            )));
        }
        if self.task.lock().is_some() {
            return Ok(());
        }

        let mut last = fingerprint(&self.path).await;
        let path = self.path.clone();
        let interval = self.poll_interval;
        let notifier = Arc::clone(&self.notifier);
        let cancel = self.cancel.clone();
        notifier.start();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let current = fingerprint(&path).await;
                if current != last {
                    tracing::debug!(path = %path.display(), "config file changed");
                    last = current;
                    notifier.notify();
                }
            }
        });

        let mut task = self.task.lock();
        if task.is_some() {
            // Lost a race with a concurrent watch; keep the first poller.
            handle.abort();
        } else {
            *task = Some(handle);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.notifier.stop();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::FileProvider;
    use crate::error::Error;
    use crate::providers::Provider;

    #[tokio::test]
    async fn missing_file_fails_unless_optional() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");

        let err = FileProvider::new(&path)
            .load()
            .await
            .expect_err("file does not exist");
        assert!(matches!(err, Error::SourceLoad(_)));

        let bytes = FileProvider::new(&path)
            .optional(true)
            .load()
            .await
            .expect("optional");
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn save_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("app.json");
        let provider = FileProvider::new(&path);

        provider.save(b"{\"a\":1}").await.expect("save");
        provider.save(b"{\"a\":2}").await.expect("save again");
        assert_eq!(provider.load().await.expect("load"), b"{\"a\":2}".to_vec());
        assert!(!super::temp_path(&path).exists());
    }

    #[tokio::test]
    async fn polling_detects_rewrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "a: 1\n").expect("seed file");

        let provider = FileProvider::new(&path).with_poll_interval(Duration::from_millis(20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.on_change(Arc::new(move || {
            let _ = tx.send(());
        }));
        provider.watch().await.expect("watch");
        provider.watch().await.expect("second watch is a no-op");

        std::fs::write(&path, "a: 22\n").expect("rewrite");
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change delivered in time")
            .expect("channel open");

        provider.close().await.expect("close");
        assert!(provider.watch().await.is_err());
    }
}
