//! Values held by proxies.
//!
//! Every value stored in a collection or variable names itself with a string
//! id. Equality is structural, so two records read back from different
//! replicas compare equal whenever their fields do.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A value that can live in a remote object.
pub trait Record: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// The id under which the value is indexed in a collection.
    fn id(&self) -> &str;
}

/// A schemaless record: an id plus a JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl Entity {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Look up a top-level field of the payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

impl Record for Entity {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for String {
    fn id(&self) -> &str {
        self
    }
}
