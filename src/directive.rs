use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::config::DirectiveConfig;

/// Turns the arguments of a directive call into the payload delivered to the
/// presentation layer.
pub type Renderer = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct DirectiveSpec {
    pub name: String,
    pub component_type: String,
    /// Whether the lifting pass turns calls to this directive into atoms.
    pub liftable: bool,
    renderer: Option<Renderer>,
}

impl DirectiveSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            component_type: name.clone(),
            name,
            liftable: true,
            renderer: None,
        }
    }

    pub fn component_type(mut self, component_type: impl Into<String>) -> Self {
        self.component_type = component_type.into();
        self
    }

    pub fn liftable(mut self, liftable: bool) -> Self {
        self.liftable = liftable;
        self
    }

    pub fn renderer<F>(mut self, renderer: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    /// Payload for the given arguments. Without a renderer the arguments are
    /// passed through unchanged.
    pub fn render(&self, args: &Value) -> Value {
        match &self.renderer {
            Some(renderer) => renderer(args),
            None => args.clone(),
        }
    }
}

impl fmt::Debug for DirectiveSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveSpec")
            .field("name", &self.name)
            .field("component_type", &self.component_type)
            .field("liftable", &self.liftable)
            .field("renderer", &self.renderer.is_some())
            .finish()
    }
}

/// Names the calls that produce artifacts. Built once at startup and shared
/// by reference with the lifting pass and every workflow.
#[derive(Debug, Clone, Default)]
pub struct DirectiveRegistry {
    directives: BTreeMap<String, DirectiveSpec>,
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[DirectiveConfig]) -> Self {
        let mut registry = Self::new();
        for entry in entries {
            let mut spec = DirectiveSpec::new(&entry.name).liftable(entry.liftable);
            if let Some(component_type) = &entry.component_type {
                spec = spec.component_type(component_type);
            }
            registry.register(spec);
        }
        registry
    }

    pub fn register(&mut self, spec: DirectiveSpec) -> &mut Self {
        if self.directives.contains_key(&spec.name) {
            tracing::debug!("Replacing directive registration: {}", spec.name);
        }
        self.directives.insert(spec.name.clone(), spec);
        self
    }

    /// Attaches a renderer to an already registered directive.
    pub fn with_renderer<F>(mut self, name: &str, renderer: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        match self.directives.remove(name) {
            Some(spec) => {
                self.directives.insert(name.to_string(), spec.renderer(renderer));
            }
            None => tracing::warn!("Renderer given for unknown directive: {}", name),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&DirectiveSpec> {
        self.directives.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    pub fn is_liftable(&self, name: &str) -> bool {
        self.directives.get(name).is_some_and(|spec| spec.liftable)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.directives.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}
