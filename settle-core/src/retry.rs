//! Retry policies for transient fetch failures
//!
//! A policy decides, for the n-th consecutive failure of a state fetch,
//! whether to try again and how long to back off first. Policies are grouped
//! by logical resource category (e.g. "database", "object_storage") in a
//! [`RetryPolicies`] registry that callers pass around explicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::waiter::FetchError;

/// Category used when no specific policy is registered
pub const DEFAULT_CATEGORY: &str = "default";

/// Decides whether a failed fetch is retried and after what delay.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Returns the delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is the number of consecutive failures so far, starting at 1.
    fn next_delay(&self, attempt: u32, error: &FetchError) -> Option<Duration>;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32, _error: &FetchError) -> Option<Duration> {
        None
    }
}

/// Truncated exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Maximum number of consecutive failures tolerated (0 = unlimited)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap for the exponential growth
    pub max_delay: Duration,
    /// Multiplier applied per failure
    pub multiplier: f64,
    /// Jitter fraction: the delay is scaled by a factor in `[1 - jitter, 1 + jitter)`
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl ExponentialBackoff {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after the given failure
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32, error: &FetchError) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return None;
        }
        Some(jittered(self.base_delay(attempt), self.jitter))
    }
}

/// Scale a delay by a random factor in `[1 - jitter, 1 + jitter)`.
pub(crate) fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let jitter = jitter.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..(1.0 + jitter));
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Retry policies keyed by resource category, with a fallback.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    default: Arc<dyn RetryPolicy>,
    by_category: HashMap<String, Arc<dyn RetryPolicy>>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl RetryPolicies {
    pub fn new(default: impl RetryPolicy + 'static) -> Self {
        Self {
            default: Arc::new(default),
            by_category: HashMap::new(),
        }
    }

    pub fn with_category(
        mut self,
        category: impl Into<String>,
        policy: impl RetryPolicy + 'static,
    ) -> Self {
        self.insert(category, Arc::new(policy));
        self
    }

    pub fn insert(&mut self, category: impl Into<String>, policy: Arc<dyn RetryPolicy>) {
        let category = category.into();
        if category == DEFAULT_CATEGORY {
            self.default = policy;
        } else {
            self.by_category.insert(category, policy);
        }
    }

    /// Policy for a category, falling back to the default one
    pub fn for_category(&self, category: &str) -> Arc<dyn RetryPolicy> {
        self.by_category
            .get(category)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.by_category.contains_key(category)
    }
}
