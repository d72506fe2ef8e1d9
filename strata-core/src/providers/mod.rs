pub mod args;
pub mod env;
pub mod file;
pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

pub use args::ArgsProvider;
pub use env::EnvProvider;
pub use file::FileProvider;
pub use memory::MemoryProvider;

pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Byte source behind one configuration layer.
///
/// `on_change` only registers; nothing is delivered until `watch` is called.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Vec<u8>>;

    async fn save(&self, bytes: &[u8]) -> Result<()>;

    fn on_change(&self, callback: ChangeCallback);

    async fn watch(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Registered change callbacks plus the delivery switch shared by the bundled
/// providers.
#[derive(Default)]
pub struct ChangeNotifier {
    callbacks: RwLock<Vec<ChangeCallback>>,
    delivering: AtomicBool,
}

impl ChangeNotifier {
    pub fn register(&self, callback: ChangeCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn start(&self) {
        self.delivering.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.delivering.store(false, Ordering::SeqCst);
    }

    pub fn is_delivering(&self) -> bool {
        self.delivering.load(Ordering::SeqCst)
    }

    pub fn notify(&self) {
        if !self.is_delivering() {
            return;
        }
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback();
        }
    }
}
