use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::providers::{ChangeCallback, ChangeNotifier, Provider};

/// In-process byte buffer. `set` (and `save`) replace the content and notify
/// once the provider is being watched.
pub struct MemoryProvider {
    name: String,
    content: RwLock<Vec<u8>>,
    notifier: ChangeNotifier,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: RwLock::new(content.into()),
            notifier: ChangeNotifier::default(),
        }
    }

    pub fn set(&self, content: impl Into<Vec<u8>>) {
        *self.content.write() = content.into();
        self.notifier.notify();
    }

    pub fn content(&self) -> Vec<u8> {
        self.content.read().clone()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Vec<u8>> {
        Ok(self.content())
    }

    async fn save(&self, bytes: &[u8]) -> Result<()> {
        self.set(bytes.to_vec());
        Ok(())
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.notifier.register(callback);
    }

    async fn watch(&self) -> Result<()> {
        self.notifier.start();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.notifier.stop();
        Ok(())
    }
}
