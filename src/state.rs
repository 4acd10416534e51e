//! Externally set component values (slider positions, text inputs, ...).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::render::normalize;

/// Component id -> last externally set value.
///
/// Cloning shares the underlying map. This is the one structure touched from
/// outside the task driving a session, hence the lock.
#[derive(Debug, Clone, Default)]
pub struct ComponentState {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl ComponentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.values.lock().get(id).cloned()
    }

    pub fn set(&self, id: impl Into<String>, value: Value) {
        self.values.lock().insert(id.into(), value);
    }

    pub fn remove(&self, id: &str) -> Option<Value> {
        self.values.lock().remove(id)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// The subset of `updates` that differs from the current state. A missing
    /// entry compares equal to `null`.
    pub fn diff(&self, updates: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let values = self.values.lock();
        changed_entries(&values, updates)
    }

    /// Diffs and merges under a single lock, returning what changed.
    pub fn apply(&self, updates: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut values = self.values.lock();
        let changed = changed_entries(&values, updates);
        for (id, value) in &changed {
            values.insert(id.clone(), value.clone());
        }
        changed
    }
}

fn changed_entries(
    current: &HashMap<String, Value>,
    updates: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    updates
        .iter()
        .filter(|(id, value)| {
            let previous = current.get(*id).map(normalize).unwrap_or(Value::Null);
            previous != normalize(value)
        })
        .map(|(id, value)| (id.clone(), normalize(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn updates(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(id, value)| (id.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_apply_returns_only_changes() {
        let state = ComponentState::new();
        state.set("slider-1", json!(5));

        let changed = state.apply(&updates(&[("slider-1", json!(5)), ("slider-2", json!(3))]));
        assert_eq!(changed, updates(&[("slider-2", json!(3))]));
        assert_eq!(state.get("slider-2"), Some(json!(3)));
    }

    #[test]
    fn test_null_matches_missing() {
        let state = ComponentState::new();
        assert!(state.diff(&updates(&[("input-1", Value::Null)])).is_empty());
        assert!(state.diff(&updates(&[("input-1", Value::from(f64::NAN))])).is_empty());
    }

    #[test]
    fn test_clones_share_values() {
        let state = ComponentState::new();
        let other = state.clone();
        other.set("a", json!("x"));
        assert_eq!(state.get("a"), Some(json!("x")));
        assert_eq!(state.len(), 1);
    }
}
