use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::AtomValue;
use crate::workflow::AtomContext;

/// The body of an atom.
pub type AtomFn = Arc<dyn Fn(&mut AtomContext<'_, '_>) -> anyhow::Result<AtomValue> + Send + Sync>;

/// Predicate deciding whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// A named, memoizable unit of computation.
#[derive(Clone)]
pub struct Atom {
    name: String,
    callable: AtomFn,
    params: Vec<String>,
    dependencies: Option<Vec<String>>,
    retry_policy: Option<RetryPolicy>,
}

impl Atom {
    pub fn new<F>(name: impl Into<String>, callable: F) -> Self
    where
        F: Fn(&mut AtomContext<'_, '_>) -> anyhow::Result<AtomValue> + Send + Sync + 'static,
    {
        Self::from_fn(name, Arc::new(callable))
    }

    pub fn from_fn(name: impl Into<String>, callable: AtomFn) -> Self {
        Self {
            name: name.into(),
            callable,
            params: Vec::new(),
            dependencies: None,
            retry_policy: None,
        }
    }

    /// Declares the callable's parameter names. Unless dependencies are set
    /// explicitly, each parameter names the atom it depends on.
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = Some(dependencies.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn dependencies(&self) -> &[String] {
        self.dependencies.as_deref().unwrap_or(&self.params)
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    /// Name under which the dependency at `index` is handed to the callable.
    pub(crate) fn param_name(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub(crate) fn callable(&self) -> &AtomFn {
        &self.callable
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("dependencies", &self.dependencies())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Upper bound for a single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: f64,
    retryable: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// A backoff factor that is negative or not finite falls back to 1.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: f64) -> Self {
        let backoff = if backoff.is_finite() && backoff >= 0.0 {
            backoff
        } else {
            tracing::warn!("Invalid retry backoff {}, using 1.0", backoff);
            1.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff,
            retryable: None,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Only retry errors of type `E`.
    pub fn retry_on<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(|err: &anyhow::Error| err.is::<E>()));
        self
    }

    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, attempt: u32, error: &anyhow::Error) -> bool {
        attempt < self.max_attempts
            && self
                .retryable
                .as_ref()
                .map(|predicate| predicate(error))
                .unwrap_or(true)
    }

    /// Delay before the attempt following `attempt`: base * backoff^(attempt-1).
    /// Saturates at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff", &self.backoff)
            .field("filtered", &self.retryable.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtomStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retry,
    Skipped,
}

impl AtomStatus {
    /// Whether the result carries a usable value.
    pub fn is_success(self) -> bool {
        matches!(self, AtomStatus::Completed | AtomStatus::Skipped)
    }
}

impl fmt::Display for AtomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AtomStatus::Pending => "pending",
            AtomStatus::Running => "running",
            AtomStatus::Completed => "completed",
            AtomStatus::Failed => "failed",
            AtomStatus::Retry => "retry",
            AtomStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Outcome of one atom in one pass. A fresh result replaces the previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomResult {
    pub name: String,
    pub status: AtomStatus,
    pub value: Option<AtomValue>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_hash: Option<String>,
}

impl AtomResult {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AtomStatus::Pending,
            value: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            input_hash: None,
        }
    }

    /// A result served from the cache for this pass.
    pub fn skipped(cached: &AtomResult) -> Self {
        let now = Utc::now();
        Self {
            name: cached.name.clone(),
            status: AtomStatus::Skipped,
            value: cached.value.clone(),
            error: None,
            attempts: 0,
            started_at: Some(now),
            finished_at: Some(now),
            input_hash: cached.input_hash.clone(),
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
