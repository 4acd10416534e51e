use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::atom::RetryPolicy;
use crate::payload::PayloadLimits;

pub const APP_NAME: &str = "atomflow";

/// Engine-wide settings, persisted with `confy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reruns triggered within this window of the previous one are dropped.
    /// Zero disables debouncing.
    pub debounce_ms: u64,
    /// Serialized component batches larger than this many bytes are compressed.
    pub compression_threshold: usize,
    /// Identifier bound to the graph object in lifted programs.
    pub workflow_binding: String,
    pub directives: Vec<DirectiveConfig>,
    pub payload: PayloadLimits,
    pub retry: RetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 0,
            compression_threshold: 16 * 1024,
            workflow_binding: "__workflow".to_string(),
            directives: Vec::new(),
            payload: PayloadLimits::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, None)
    }

    pub fn load_path(path: impl AsRef<Path>) -> Result<Self, confy::ConfyError> {
        confy::load_path(path)
    }

    pub fn store_path(&self, path: impl AsRef<Path>) -> Result<(), confy::ConfyError> {
        confy::store_path(path, self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.backoff,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff: 2.0,
        }
    }
}

/// A directive entry as it appears in the config file. Renderers are attached
/// in code, see [`crate::DirectiveRegistry::with_renderer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveConfig {
    pub name: String,
    #[serde(default)]
    pub component_type: Option<String>,
    #[serde(default = "default_liftable")]
    pub liftable: bool,
}

fn default_liftable() -> bool {
    true
}
