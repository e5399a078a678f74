//! Local value storage.
//!
//! A key maps to a *set* of distinct string values. Storage is pluggable via
//! [`ValueStore`]; [`MemoryValueStore`] is the in-process default. The trait is
//! synchronous: every operation is a short critical section and is called from
//! request handlers and actions alike.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

pub trait ValueStore: Send + Sync {
    /// Snapshot of every key with its values.
    fn get_all_entries(&self) -> Vec<(String, Vec<String>)>;

    /// All values stored under `key`, or `None` if there are none.
    fn get(&self, key: &str) -> Option<Vec<String>>;

    /// Add `value` to the set under `key`. Storing a value twice is a no-op.
    fn set(&self, key: &str, value: &str);

    /// Remove `value` from the set under `key`. Returns whether it was present.
    fn remove(&self, key: &str, value: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryValueStore {
    entries: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemoryValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValueStore for MemoryValueStore {
    fn get_all_entries(&self) -> Vec<(String, Vec<String>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|(key, values)| (key.clone(), values.iter().cloned().collect()))
            .collect()
    }

    fn get(&self, key: &str) -> Option<Vec<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|values| !values.is_empty())
            .map(|values| values.iter().cloned().collect())
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key.to_owned())
            .or_default()
            .insert(value.to_owned());
    }

    fn remove(&self, key: &str, value: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(values) = entries.get_mut(key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            entries.remove(key);
        }
        removed
    }
}
