use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::path::ConfigPath;
use crate::storage::{Scalar, Storage};

/// Decorator that checks every value bound from it against a JSON schema.
///
/// Reads are passed through untouched. Sub-views are the wrapped storage's own
/// sub-views, so only binds from the decorated node itself are validated.
#[derive(Clone)]
pub struct ValidateStorage {
    inner: Arc<dyn Storage>,
    schema: Arc<JSONSchema>,
}

impl ValidateStorage {
    pub fn new(inner: Arc<dyn Storage>, schema: &Value) -> Result<Self> {
        let compiled = JSONSchema::compile(schema)
            .map_err(|err| Error::Config(format!("failed compiling validation schema: {err}")))?;
        Ok(Self {
            inner,
            schema: Arc::new(compiled),
        })
    }

    pub fn into_shared(self) -> Arc<dyn Storage> {
        Arc::new(self)
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    /// Checks `value` against the schema without binding anything.
    pub fn check(&self, value: &Value) -> Result<()> {
        if let Err(errors) = self.schema.validate(value) {
            let details = errors
                .map(|err| format!("{}: {}", err.instance_path, err))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Validation(details));
        }
        Ok(())
    }
}

impl fmt::Debug for ValidateStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidateStorage")
            .field("present", &self.inner.is_present())
            .finish_non_exhaustive()
    }
}

impl Storage for ValidateStorage {
    fn sub_path(&self, path: &ConfigPath) -> Arc<dyn Storage> {
        self.inner.sub_path(path)
    }

    fn is_present(&self) -> bool {
        self.inner.is_present()
    }

    fn scalar(&self) -> Option<Scalar> {
        self.inner.scalar()
    }

    fn elements(&self) -> Option<Vec<Arc<dyn Storage>>> {
        self.inner.elements()
    }

    fn keys(&self) -> Option<Vec<String>> {
        self.inner.keys()
    }

    fn to_value(&self) -> Option<Value> {
        self.inner.to_value()
    }

    fn validate(&self, bound: &Value) -> Result<()> {
        self.inner.validate(bound)?;
        self.check(bound)
    }
}
