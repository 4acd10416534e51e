//! Read-time dependency tracking.
//!
//! While an atom body runs, its name sits on top of the [`DependencyTracker`]
//! stack. Reading a [`TrackedValue`] produced by another atom records a
//! consumer -> producer edge in [`DynamicEdges`], which the workflow merges with
//! the statically declared dependencies on the next pass. Nested entries
//! appear when an atom pulls another atom on demand.

use std::collections::{BTreeMap, BTreeSet};

use crate::value::AtomValue;

/// A value together with the name of the atom that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedValue {
    value: AtomValue,
    producer: String,
}

impl TrackedValue {
    pub fn new(value: AtomValue, producer: impl Into<String>) -> Self {
        Self {
            value,
            producer: producer.into(),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Reads the value, recording an edge from the active atom to the producer.
    pub fn read(&self, tracker: &DependencyTracker, edges: &mut DynamicEdges) -> &AtomValue {
        tracker.track_dependency(&self.producer, edges);
        &self.value
    }

    /// Reads the value without recording anything.
    pub fn peek(&self) -> &AtomValue {
        &self.value
    }

    pub fn into_value(self) -> AtomValue {
        self.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveAtom {
    name: String,
}

#[derive(Debug, Default)]
pub struct DependencyTracker {
    stack: Vec<ActiveAtom>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, name: &str) {
        tracing::trace!("Entering atom context: {}", name);
        self.stack.push(ActiveAtom {
            name: name.to_string(),
        });
    }

    pub fn exit(&mut self) -> Option<String> {
        self.stack.pop().map(|active| active.name)
    }

    pub fn current(&self) -> Option<&str> {
        self.stack.last().map(|active| active.name.as_str())
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.stack.iter().any(|active| active.name == name)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Names on the stack, outermost first.
    pub fn stack(&self) -> Vec<String> {
        self.stack.iter().map(|active| active.name.clone()).collect()
    }

    /// Records that the active atom read a value produced by `producer`.
    ///
    /// Returns whether a new edge was added. Without an active atom this is a
    /// no-op.
    pub fn track_dependency(&self, producer: &str, edges: &mut DynamicEdges) -> bool {
        match self.current() {
            Some(consumer) => edges.register(consumer, producer),
            None => {
                tracing::debug!(
                    "Read of '{}' outside any atom context, dependency not tracked",
                    producer
                );
                false
            }
        }
    }
}

/// Dependency edges discovered at runtime, consumer -> producers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicEdges {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DynamicEdges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, consumer: &str, producer: &str) -> bool {
        if consumer == producer {
            return false;
        }
        let added = self
            .edges
            .entry(consumer.to_string())
            .or_default()
            .insert(producer.to_string());
        if added {
            tracing::debug!("Discovered dependency {} -> {}", consumer, producer);
        }
        added
    }

    pub fn dependencies_of(&self, consumer: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(consumer)
            .into_iter()
            .flat_map(|producers| producers.iter().map(String::as_str))
    }

    /// Drops every edge touching `name`.
    pub fn remove_atom(&mut self, name: &str) {
        self.edges.remove(name);
        for producers in self.edges.values_mut() {
            producers.remove(name);
        }
        self.edges.retain(|_, producers| !producers.is_empty());
    }

    pub fn len(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_records_edge_for_active_atom() {
        let mut tracker = DependencyTracker::new();
        let mut edges = DynamicEdges::new();
        let value = TrackedValue::new(AtomValue::from(10), "load");

        tracker.enter("double");
        assert_eq!(value.read(&tracker, &mut edges), &AtomValue::from(10));
        tracker.exit();

        assert_eq!(edges.dependencies_of("double").collect::<Vec<_>>(), vec!["load"]);
    }

    #[test]
    fn test_read_outside_context_is_noop() {
        let tracker = DependencyTracker::new();
        let mut edges = DynamicEdges::new();
        let value = TrackedValue::new(AtomValue::from("x"), "load");

        value.read(&tracker, &mut edges);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_nested_contexts_attribute_to_innermost() {
        let mut tracker = DependencyTracker::new();
        let mut edges = DynamicEdges::new();

        tracker.enter("outer");
        tracker.enter("inner");
        assert!(tracker.track_dependency("source", &mut edges));
        assert!(!tracker.track_dependency("source", &mut edges));
        assert_eq!(tracker.stack(), vec!["outer", "inner"]);
        tracker.exit();
        assert_eq!(tracker.current(), Some("outer"));

        assert_eq!(edges.dependencies_of("inner").collect::<Vec<_>>(), vec!["source"]);
        assert_eq!(edges.dependencies_of("outer").count(), 0);
    }

    #[test]
    fn test_self_edges_and_removal() {
        let mut edges = DynamicEdges::new();
        assert!(!edges.register("a", "a"));
        edges.register("a", "b");
        edges.register("c", "b");
        assert_eq!(edges.len(), 2);

        edges.remove_atom("b");
        assert!(edges.is_empty());
    }
}
