//! Layered configuration: ordered sources merged by priority into one
//! path-addressable view, typed binding through serde, and change handlers run
//! under a timeout and error policy.

pub mod decoders;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod providers;
pub mod registry;
pub mod storage;

pub use decoders::Decoder;
pub use engine::{ConfigEngine, DispatchReport, EngineOptions, ErrorPolicy, ExecutorOptions};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use providers::Provider;
pub use registry::Registry;
pub use storage::{ConfigPath, Storage};
