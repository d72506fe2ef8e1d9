use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::path::ConfigPath;
use crate::storage::{Scalar, Storage};

/// Priority-ordered composite: index 0 is the lowest priority, the last member
/// the highest.
///
/// Nothing is cached; every query walks the current members, so the merged view
/// is always computed from whatever snapshots the members hold. Merging never
/// mutates a member.
#[derive(Clone, Default)]
pub struct MultiStorage {
    members: Vec<Arc<dyn Storage>>,
}

impl MultiStorage {
    pub fn new(members: Vec<Arc<dyn Storage>>) -> Result<Self> {
        for (position, member) in members.iter().enumerate() {
            let duplicate = members[..position]
                .iter()
                .any(|other| same_storage(other, member));
            if duplicate {
                return Err(Error::Config(format!(
                    "storage at priority {position} is already a member of this merge"
                )));
            }
        }
        Ok(Self { members })
    }

    /// For callers that already guarantee distinct members.
    pub(crate) fn from_distinct(members: Vec<Arc<dyn Storage>>) -> Self {
        Self { members }
    }

    pub fn into_shared(self) -> Arc<dyn Storage> {
        Arc::new(self)
    }

    pub fn members(&self) -> &[Arc<dyn Storage>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn top_present(&self) -> Option<&Arc<dyn Storage>> {
        self.members.iter().rev().find(|member| member.is_present())
    }
}

/// The members that still contribute at this level: walking down from the
/// highest priority, mappings let lower members show through and the first
/// present non-mapping hides everything below it.
fn visible(members: &[Arc<dyn Storage>]) -> &[Arc<dyn Storage>] {
    let start = members
        .iter()
        .rposition(|member| member.is_present() && member.keys().is_none())
        .unwrap_or(0);
    &members[start..]
}

impl fmt::Debug for MultiStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiStorage")
            .field("members", &self.members.len())
            .finish()
    }
}

pub(crate) fn same_storage(left: &Arc<dyn Storage>, right: &Arc<dyn Storage>) -> bool {
    Arc::as_ptr(left) as *const () == Arc::as_ptr(right) as *const ()
}

impl Storage for MultiStorage {
    fn sub_path(&self, path: &ConfigPath) -> Arc<dyn Storage> {
        let mut members = self.members.clone();
        for segment in path.segments() {
            let step = ConfigPath::from_segments(vec![segment.clone()]);
            members = visible(&members)
                .iter()
                .map(|member| member.sub_path(&step))
                .collect();
        }
        Arc::new(Self { members })
    }

    fn is_present(&self) -> bool {
        self.members.iter().any(|member| member.is_present())
    }

    /// Leaves are overridden: the highest member that has anything here decides.
    fn scalar(&self) -> Option<Scalar> {
        self.top_present()?.scalar()
    }

    /// Sequences are replaced whole by the highest present member.
    fn elements(&self) -> Option<Vec<Arc<dyn Storage>>> {
        self.top_present()?.elements()
    }

    /// Mappings are a union down to the first member holding something else;
    /// keys keep the order of first appearance from the lowest priority upwards.
    fn keys(&self) -> Option<Vec<String>> {
        if self.top_present()?.keys().is_none() {
            return None;
        }
        let mut union = Vec::new();
        for keys in visible(&self.members).iter().filter_map(|member| member.keys()) {
            for key in keys {
                if !union.contains(&key) {
                    union.push(key);
                }
            }
        }
        Some(union)
    }

    fn to_value(&self) -> Option<Value> {
        visible(&self.members)
            .iter()
            .filter_map(|member| member.to_value())
            .reduce(|base, overlay| merge_value(&base, &overlay))
    }

    fn validate(&self, bound: &Value) -> Result<()> {
        for member in &self.members {
            member.validate(bound)?;
        }
        Ok(())
    }
}

/// Overlays `overlay` onto `base`: objects merge key by key, anything else
/// (scalars, arrays) is replaced whole.
pub fn merge_value(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) => {
            let mut merged = base_obj.clone();
            for (key, value) in overlay_obj {
                let merged_value = if let Some(existing) = merged.get(key) {
                    merge_value(existing, value)
                } else {
                    value.clone()
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}
