use std::time::Duration;

/// Notifications published by a running engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A source was reloaded and its snapshot swapped in.
    SourceUpdated {
        source: String,
        changed_paths: Vec<String>,
    },
    /// Loading or decoding a source failed; the previous snapshot is kept.
    SourceFailed {
        source: String,
        error: String,
    },
    HandlerSucceeded {
        path: String,
        index: usize,
        elapsed: Duration,
    },
    HandlerFailed {
        path: String,
        index: usize,
        elapsed: Duration,
        error: String,
    },
    HandlerTimedOut {
        path: String,
        index: usize,
        elapsed: Duration,
    },
    /// Handlers after a failure were not run because of the stop policy.
    DispatchHalted {
        path: String,
        skipped: usize,
    },
    Watching,
    Closed {
        error: Option<String>,
    },
}

impl Event {
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::HandlerSucceeded { path, .. }
            | Self::HandlerFailed { path, .. }
            | Self::HandlerTimedOut { path, .. }
            | Self::DispatchHalted { path, .. } => Some(path),
            _ => None,
        }
    }
}
