use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("source load error: {0}")]
    SourceLoad(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("handler #{index} for '{path}' failed: {message}")]
    HandlerFailure {
        path: String,
        index: usize,
        message: String,
    },

    #[error("handler #{index} for '{path}' timed out after {timeout_ms}ms")]
    HandlerTimeout {
        path: String,
        index: usize,
        timeout_ms: u64,
    },

    #[error("config engine is closed")]
    EngineClosed,
}

impl serde::de::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self::Bind(msg.to_string())
    }
}
