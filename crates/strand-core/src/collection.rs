//! Observed-Remove collection model keyed by record id
//!
//! Each value is identified by an id and a set of membership keys. Concurrent
//! adds of the same value use the same id but different keys. A value is
//! removed by removing the keys that were observed for it, and is absent once
//! none of its keys remain.
//!
//! Applying the same add or remove twice is a no-op, and adds commute with one
//! another, so replicas that see the same operations converge on the same
//! `id -> keys` mapping.

use crate::error::{CrdtError, Result};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// An opaque token for one observation of a value's presence.
pub type MembershipKey = String;

/// Generate a membership key that no other writer will produce.
pub fn fresh_key(replica_id: &str) -> MembershipKey {
    format!("{}:{}", replica_id, Ulid::new())
}

/// A stored value and the keys that keep it present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrdtEntry<T> {
    pub value: T,
    pub keys: IndexSet<MembershipKey>,
}

/// Literal form of one entry, as exchanged with the backing store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry<T> {
    pub id: String,
    pub value: T,
    #[serde(default)]
    pub keys: Vec<MembershipKey>,
}

impl<T> ModelEntry<T> {
    pub fn new(id: impl Into<String>, value: T, keys: Vec<MembershipKey>) -> Self {
        Self {
            id: id.into(),
            value,
            keys,
        }
    }
}

/// The collection model. Iteration follows insertion order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrdtCollection<T> {
    items: IndexMap<String, CrdtEntry<T>>,
}

impl<T: Clone + PartialEq> CrdtCollection<T> {
    pub fn new() -> Self {
        Self {
            items: IndexMap::new(),
        }
    }

    /// Rebuild a model from its literal form. Entries without keys are not
    /// present and are skipped.
    pub fn from_literal(entries: impl IntoIterator<Item = ModelEntry<T>>) -> Self {
        let items = entries
            .into_iter()
            .filter(|entry| !entry.keys.is_empty())
            .map(|entry| {
                let keys = entry.keys.into_iter().collect();
                (
                    entry.id,
                    CrdtEntry {
                        value: entry.value,
                        keys,
                    },
                )
            })
            .collect();
        Self { items }
    }

    /// Add membership `keys` for `value` under `id`.
    ///
    /// Returns whether the value changed: `id` was new, or the stored value
    /// differed. Merging keys into an unchanged value returns `false` even
    /// though the key set grew.
    pub fn add(&mut self, id: &str, value: T, keys: &[MembershipKey]) -> Result<bool> {
        self.check_add(id, &value, keys)?;

        let Some(entry) = self.items.get_mut(id) else {
            self.items.insert(
                id.to_string(),
                CrdtEntry {
                    value,
                    keys: keys.iter().cloned().collect(),
                },
            );
            return Ok(true);
        };

        if entry.value == value {
            entry.keys.extend(keys.iter().cloned());
            return Ok(false);
        }

        entry.keys.extend(keys.iter().cloned());
        entry.value = value;
        Ok(true)
    }

    /// Fail exactly when [`add`](Self::add) would, without touching the model.
    pub fn check_add(&self, id: &str, value: &T, keys: &[MembershipKey]) -> Result<()> {
        if keys.is_empty() {
            return Err(CrdtError::EmptyKeys { id: id.to_string() });
        }
        match self.items.get(id) {
            // A value change must carry fresh provenance.
            Some(entry)
                if entry.value != *value && keys.iter().all(|key| entry.keys.contains(key)) =>
            {
                Err(CrdtError::MissingNewKeys { id: id.to_string() })
            }
            _ => Ok(()),
        }
    }

    /// Remove membership `keys` from the value under `id`.
    ///
    /// Returns `true` iff no keys remain, in which case the entry is dropped.
    pub fn remove(&mut self, id: &str, keys: &[MembershipKey]) -> bool {
        let Some(entry) = self.items.get_mut(id) else {
            return false;
        };
        for key in keys {
            entry.keys.shift_remove(key);
        }
        if entry.keys.is_empty() {
            self.items.shift_remove(id);
            true
        } else {
            false
        }
    }

    pub fn to_literal(&self) -> Vec<ModelEntry<T>> {
        self.items
            .iter()
            .map(|(id, entry)| ModelEntry {
                id: id.clone(),
                value: entry.value.clone(),
                keys: entry.keys.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn to_list(&self) -> Vec<T> {
        self.items.values().map(|entry| entry.value.clone()).collect()
    }

    pub fn get_value(&self, id: &str) -> Option<&T> {
        self.items.get(id).map(|entry| &entry.value)
    }

    /// Keys observed for `id`, in the order they were first seen.
    pub fn get_keys(&self, id: &str) -> Vec<MembershipKey> {
        self.items
            .get(id)
            .map(|entry| entry.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CrdtEntry<T>)> {
        self.items.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone + PartialEq> Default for CrdtCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}
