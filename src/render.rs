//! Artifact descriptors and the render buffer that suppresses redundant
//! deliveries.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::hex_digest;

/// Source position of a directive call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Callsite {
    pub file: String,
    pub line: u32,
}

impl Callsite {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// The caller's position, propagated through `#[track_caller]` frames.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for Callsite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Deterministic artifact id for a directive call.
///
/// The same directive at the same callsite with the same identifier always
/// maps to the same id across reruns; distinct callsites get distinct ids.
pub fn component_id(directive: &str, callsite: &Callsite, identifier: Option<&str>) -> String {
    let material = match identifier {
        Some(identifier) => format!("{}\0{}\0{}", directive, callsite, identifier),
        None => format!("{}\0{}", directive, callsite),
    };
    let digest = hex_digest(material.as_bytes());
    format!("{}-{}", directive, &digest[..8])
}

/// An artifact produced by one directive invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub payload: Value,
    pub should_render: bool,
}

impl Component {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            payload,
            should_render: false,
        }
    }

    /// Fingerprint of everything the presentation layer would see.
    pub fn fingerprint(&self) -> String {
        let material = serde_json::json!({
            "type": self.component_type,
            "payload": normalize(&self.payload),
        });
        hex_digest(material.to_string().as_bytes())
    }
}

/// Canonical form used for comparison. Non-finite floats already arrive as
/// null (serde_json has no representation for them); `-0.0` is folded into
/// `0.0` so both fingerprint the same.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() && n.as_f64() == Some(0.0) => Value::from(0.0),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), normalize(value)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderDecision {
    /// First sighting this pass and different from the last delivery.
    Render,
    /// Identical to the last delivered fingerprint.
    Unchanged,
    /// The id was already seen earlier in this pass; ignored.
    Duplicate,
}

/// Last delivered fingerprint per artifact id. Persists across reruns.
#[derive(Debug, Default)]
pub struct RenderBuffer {
    fingerprints: HashMap<String, String>,
    seen_this_pass: HashSet<String>,
}

impl RenderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_pass(&mut self) {
        self.seen_this_pass.clear();
    }

    /// Compares the component against the last delivery and sets its
    /// `should_render` flag accordingly.
    pub fn observe(&mut self, component: &mut Component) -> RenderDecision {
        if !self.seen_this_pass.insert(component.id.clone()) {
            component.should_render = false;
            tracing::debug!("Ignoring duplicate component in pass: {}", component.id);
            return RenderDecision::Duplicate;
        }

        let fingerprint = component.fingerprint();
        let changed = self
            .fingerprints
            .get(&component.id)
            .is_none_or(|previous| *previous != fingerprint);

        component.should_render = changed;
        if changed {
            self.fingerprints.insert(component.id.clone(), fingerprint);
            RenderDecision::Render
        } else {
            RenderDecision::Unchanged
        }
    }

    pub fn fingerprint(&self, id: &str) -> Option<&str> {
        self.fingerprints.get(id).map(String::as_str)
    }

    pub fn forget(&mut self, id: &str) -> bool {
        self.fingerprints.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.fingerprints.clear();
        self.seen_this_pass.clear();
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_component_id_is_deterministic() {
        let site = Callsite::new("app.js", 4);
        let a = component_id("text", &site, None);
        let b = component_id("text", &site, None);
        assert_eq!(a, b);
        assert!(a.starts_with("text-"));
        assert_eq!(a.len(), "text-".len() + 8);

        let other_line = component_id("text", &Callsite::new("app.js", 5), None);
        let with_identifier = component_id("text", &site, Some("header"));
        assert_ne!(a, other_line);
        assert_ne!(a, with_identifier);
    }

    #[test]
    fn test_callsite_caller_points_here() {
        let site = Callsite::caller();
        assert!(site.file.ends_with("render.rs"));
        assert!(site.line > 0);
    }

    #[test]
    fn test_identical_payload_is_suppressed() {
        let mut buffer = RenderBuffer::new();

        buffer.begin_pass();
        let mut first = Component::new("text-1", "text", json!({"value": "hello"}));
        assert_eq!(buffer.observe(&mut first), RenderDecision::Render);
        assert!(first.should_render);

        buffer.begin_pass();
        let mut second = Component::new("text-1", "text", json!({"value": "hello"}));
        assert_eq!(buffer.observe(&mut second), RenderDecision::Unchanged);
        assert!(!second.should_render);

        buffer.begin_pass();
        let mut third = Component::new("text-1", "text", json!({"value": "bye"}));
        assert_eq!(buffer.observe(&mut third), RenderDecision::Render);
        assert!(third.should_render);
    }

    #[test]
    fn test_duplicate_in_same_pass_ignored() {
        let mut buffer = RenderBuffer::new();
        buffer.begin_pass();

        let mut first = Component::new("slider-1", "slider", json!({"value": 1}));
        let mut second = Component::new("slider-1", "slider", json!({"value": 2}));
        assert_eq!(buffer.observe(&mut first), RenderDecision::Render);
        assert_eq!(buffer.observe(&mut second), RenderDecision::Duplicate);
        assert!(!second.should_render);

        // the first occurrence is what got recorded
        assert_eq!(buffer.fingerprint("slider-1"), Some(first.fingerprint().as_str()));
    }

    #[test]
    fn test_type_change_rerenders() {
        let mut buffer = RenderBuffer::new();
        buffer.begin_pass();
        buffer.observe(&mut Component::new("c", "text", json!(1)));
        buffer.begin_pass();
        let mut changed = Component::new("c", "markdown", json!(1));
        assert_eq!(buffer.observe(&mut changed), RenderDecision::Render);
    }

    #[test]
    fn test_normalize_zero_and_nested() {
        assert_eq!(normalize(&json!(-0.0)), json!(0.0));
        assert_eq!(normalize(&json!({"a": [1, -0.0]})), json!({"a": [1, 0.0]}));
        assert_eq!(normalize(&json!(3)), json!(3));
    }

    #[test]
    fn test_serialized_shape() {
        let mut component = Component::new("text-1", "text", json!({"value": 1}));
        component.should_render = true;
        let encoded = serde_json::to_value(&component).unwrap();
        assert_eq!(
            encoded,
            json!({"id": "text-1", "type": "text", "payload": {"value": 1}, "shouldRender": true})
        );
    }
}
