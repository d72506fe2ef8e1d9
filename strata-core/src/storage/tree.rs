use std::sync::Arc;

use serde_json::Value;

use crate::storage::path::{ConfigPath, Segment};
use crate::storage::{Scalar, Storage};

/// Storage over a decoded document (JSON, YAML, TOML all land here).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStorage {
    value: Option<Value>,
}

impl TreeStorage {
    pub fn new(value: Value) -> Self {
        Self { value: Some(value) }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> Arc<dyn Storage> {
        Arc::new(self)
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

impl From<Value> for TreeStorage {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

fn navigate<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut cursor = value;
    for segment in segments {
        cursor = match segment {
            Segment::Key(key) => cursor.as_object()?.get(key)?,
            Segment::Index(index) => cursor.as_array()?.get(*index)?,
            Segment::AnyKey | Segment::AnyIndex => return None,
        };
    }
    Some(cursor)
}

impl Storage for TreeStorage {
    fn sub_path(&self, path: &ConfigPath) -> Arc<dyn Storage> {
        let value = self
            .value
            .as_ref()
            .and_then(|value| navigate(value, path.segments()))
            .cloned();
        Arc::new(Self { value })
    }

    fn is_present(&self) -> bool {
        self.value.is_some()
    }

    fn scalar(&self) -> Option<Scalar> {
        self.value.as_ref().and_then(Scalar::from_value)
    }

    fn elements(&self) -> Option<Vec<Arc<dyn Storage>>> {
        let items = self.value.as_ref()?.as_array()?;
        Some(
            items
                .iter()
                .map(|item| Arc::new(Self::new(item.clone())) as Arc<dyn Storage>)
                .collect(),
        )
    }

    fn keys(&self) -> Option<Vec<String>> {
        let object = self.value.as_ref()?.as_object()?;
        Some(object.keys().cloned().collect())
    }

    fn to_value(&self) -> Option<Value> {
        self.value.clone()
    }
}
