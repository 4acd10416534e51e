//! Memoization of atom results keyed by a hash of their inputs.

use std::collections::{BTreeMap, HashMap};

use crate::atom::AtomResult;
use crate::value::{AtomValue, hex_digest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputHash {
    pub digest: String,
    /// Set when at least one input could only be hashed by identity. Such
    /// atoms are recomputed on every pass.
    pub volatile: bool,
}

/// Stable hash of an atom name and its resolved dependency values.
///
/// Dependencies are hashed in name order, so two maps with value-equal
/// entries always produce the same digest.
pub fn compute_input_hash(name: &str, resolved: &BTreeMap<String, AtomValue>) -> InputHash {
    let mut volatile = false;
    let mut material = String::with_capacity(64 * (resolved.len() + 1));
    material.push_str(name);

    for (dep, value) in resolved {
        let value_hash = match value.content_hash() {
            Ok(hash) => hash,
            Err(e) => {
                tracing::debug!(
                    "Input '{}' of atom '{}' is not serializable ({}), hashing by identity",
                    dep,
                    name,
                    e
                );
                volatile = true;
                value.identity_hash()
            }
        };
        material.push('\0');
        material.push_str(dep);
        material.push('=');
        material.push_str(&value_hash);
    }

    InputHash {
        digest: hex_digest(material.as_bytes()),
        volatile,
    }
}

/// Last result per atom name.
#[derive(Debug, Default)]
pub struct AtomCache {
    entries: HashMap<String, CachedResult>,
}

#[derive(Debug, Clone)]
struct CachedResult {
    result: AtomResult,
    volatile: bool,
}

impl AtomCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&AtomResult> {
        self.entries.get(name).map(|entry| &entry.result)
    }

    /// Replaces any previous entry for the atom.
    pub fn store(&mut self, result: AtomResult, hash: &InputHash) {
        let mut result = result;
        result.input_hash = Some(hash.digest.clone());
        self.entries.insert(
            result.name.clone(),
            CachedResult {
                result,
                volatile: hash.volatile,
            },
        );
    }

    /// A cached result is valid iff it succeeded, its stored hash matches
    /// `hash`, neither side is volatile, and recomputation is not forced.
    pub fn is_valid(&self, name: &str, hash: &InputHash, force_recompute: bool) -> bool {
        if force_recompute || hash.volatile {
            return false;
        }
        match self.entries.get(name) {
            Some(entry) => {
                !entry.volatile
                    && entry.result.status.is_success()
                    && entry.result.input_hash.as_deref() == Some(hash.digest.as_str())
            }
            None => false,
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<AtomResult> {
        self.entries.remove(name).map(|entry| entry.result)
    }

    /// Drops entries whose atom is no longer registered.
    pub fn sweep<F>(&mut self, is_live: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|name, _| is_live(name));
        let swept = before - self.entries.len();
        if swept > 0 {
            tracing::debug!("Swept {} cache entries of unregistered atoms", swept);
        }
        swept
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomStatus;
    use serde_json::json;

    fn deps(pairs: &[(&str, AtomValue)]) -> BTreeMap<String, AtomValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn completed(name: &str, value: i64) -> AtomResult {
        let mut result = AtomResult::pending(name);
        result.status = AtomStatus::Completed;
        result.value = Some(AtomValue::from(value));
        result
    }

    #[test]
    fn test_hash_stable_for_equal_inputs() {
        let a = compute_input_hash("double", &deps(&[("load", AtomValue::from(json!({"rows": [1, 2]})))]));
        let b = compute_input_hash("double", &deps(&[("load", AtomValue::from(json!({"rows": [1, 2]})))]));
        assert_eq!(a, b);
        assert!(!a.volatile);
    }

    #[test]
    fn test_hash_differs_on_value_or_name() {
        let base = compute_input_hash("double", &deps(&[("load", AtomValue::from(10))]));
        let changed = compute_input_hash("double", &deps(&[("load", AtomValue::from(5))]));
        let renamed = compute_input_hash("triple", &deps(&[("load", AtomValue::from(10))]));
        assert_ne!(base, changed);
        assert_ne!(base, renamed);
    }

    #[test]
    fn test_opaque_input_marks_volatile() {
        let hash = compute_input_hash("use_conn", &deps(&[("conn", AtomValue::opaque(42u32))]));
        assert!(hash.volatile);
    }

    #[test]
    fn test_validity_rules() {
        let mut cache = AtomCache::new();
        let hash = compute_input_hash("load", &BTreeMap::new());
        assert!(!cache.is_valid("load", &hash, false));

        cache.store(completed("load", 10), &hash);
        assert!(cache.is_valid("load", &hash, false));
        assert!(!cache.is_valid("load", &hash, true));

        let other = compute_input_hash("load", &deps(&[("x", AtomValue::from(1))]));
        assert!(!cache.is_valid("load", &other, false));

        let mut failed = completed("load", 0);
        failed.status = AtomStatus::Failed;
        cache.store(failed, &hash);
        assert!(!cache.is_valid("load", &hash, false));
    }

    #[test]
    fn test_sweep_removes_unregistered() {
        let mut cache = AtomCache::new();
        let hash = compute_input_hash("a", &BTreeMap::new());
        cache.store(completed("a", 1), &hash);
        cache.store(completed("b", 2), &hash);

        assert_eq!(cache.sweep(|name| name == "a"), 1);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }
}
