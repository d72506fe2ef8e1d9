pub mod bind;
pub mod flat;
pub mod multi;
pub mod path;
pub mod tree;
pub mod validate;

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

pub use bind::StorageDeserializer;
pub use flat::{FlatOptions, FlatStorage, IndexMarker};
pub use multi::{merge_value, MultiStorage};
pub use path::{ConfigPath, Segment};
pub use tree::TreeStorage;
pub use validate::ValidateStorage;

/// Leaf value exposed by a storage node.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(flag) => Some(Self::Bool(*flag)),
            Value::Number(number) => {
                if let Some(signed) = number.as_i64() {
                    Some(Self::Integer(signed))
                } else if let Some(unsigned) = number.as_u64() {
                    Some(Self::Unsigned(unsigned))
                } else {
                    number.as_f64().map(Self::Float)
                }
            }
            Value::String(text) => Some(Self::Text(text.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(flag),
            Self::Integer(signed) => Value::from(signed),
            Self::Unsigned(unsigned) => Value::from(unsigned),
            Self::Float(float) => Value::from(float),
            Self::Text(text) => Value::String(text),
        }
    }
}

/// Hierarchical, path-addressable configuration view.
///
/// Navigation never fails: an absent path yields an empty view of the same kind
/// whose [`Storage::is_present`] is `false`. Binding into typed values goes through
/// [`StorageDeserializer`], which only uses the methods below, so any
/// implementation can be merged by [`MultiStorage`].
pub trait Storage: Send + Sync {
    fn sub_path(&self, path: &ConfigPath) -> Arc<dyn Storage>;

    fn is_present(&self) -> bool;

    /// The leaf at this node, if it is one.
    fn scalar(&self) -> Option<Scalar>;

    /// Ordered children when this node can be read as a sequence.
    fn elements(&self) -> Option<Vec<Arc<dyn Storage>>>;

    /// Child keys when this node can be read as a mapping.
    fn keys(&self) -> Option<Vec<String>>;

    /// Untyped materialization of the subtree, `None` when absent.
    fn to_value(&self) -> Option<Value>;

    fn equals(&self, other: &dyn Storage) -> bool {
        self.to_value() == other.to_value()
    }

    /// Hook run against the bound result of every conversion.
    fn validate(&self, _bound: &Value) -> Result<()> {
        Ok(())
    }

    fn sub(&self, path: &str) -> Arc<dyn Storage> {
        self.sub_path(&ConfigPath::parse(path))
    }

    fn child(&self, segment: Segment) -> Arc<dyn Storage> {
        self.sub_path(&ConfigPath::from_segments(vec![segment]))
    }
}
