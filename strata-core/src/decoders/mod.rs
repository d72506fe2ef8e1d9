pub mod document;
pub mod flat;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::Storage;

pub use document::{JsonDecoder, TomlDecoder, YamlDecoder};
pub use flat::FlatDecoder;

/// Turns raw provider bytes into a [`Storage`] and back.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Storage>>;

    fn encode(&self, storage: &dyn Storage) -> Result<Vec<u8>>;
}

/// Picks a document decoder from a file extension.
pub fn decoder_for_extension(extension: &str) -> Option<Arc<dyn Decoder>> {
    match extension.to_ascii_lowercase().as_str() {
        "json" => Some(Arc::new(JsonDecoder)),
        "yaml" | "yml" => Some(Arc::new(YamlDecoder)),
        "toml" => Some(Arc::new(TomlDecoder)),
        "env" => Some(Arc::new(FlatDecoder::default())),
        _ => None,
    }
}

fn utf8<'a>(bytes: &'a [u8], format: &str) -> Result<&'a str> {
    std::str::from_utf8(bytes)
        .map_err(|err| Error::Decode(format!("{format} input is not valid UTF-8: {err}")))
}
