//! App state reconciliation
//!
//! A script works on a copy of its app's state. Only the keys it changed are
//! merged back, so keys updated elsewhere in the meantime survive.

use serde_json::{Map, Value};

/// Top-level key changes between two state snapshots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    /// Added or updated keys with their new values
    pub changed: Map<String, Value>,
    /// Keys the script removed
    pub removed: Vec<String>,
}

impl StateDiff {
    pub fn compute(before: &Map<String, Value>, after: &Map<String, Value>) -> Self {
        let changed = after
            .iter()
            .filter(|(key, value)| before.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let removed = before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned()
            .collect();
        Self { changed, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    /// Merge into persisted state; applying twice equals applying once
    pub fn apply(&self, state: &mut Map<String, Value>) {
        for (key, value) in &self.changed {
            state.insert(key.clone(), value.clone());
        }
        for key in &self.removed {
            state.remove(key);
        }
    }
}
