//! Configuration for timeouts, polling and retry policies
//!
//! Loaded from a JSON file; every field has a default so an empty object
//! (or no file at all) is a valid configuration.
//!
//! ```json
//! {
//!   "timeouts": { "create_secs": 1800 },
//!   "polling": { "interval_ms": 2000 },
//!   "retry": { "database": { "max_attempts": 12 } },
//!   "kind_timeouts": { "database": { "create_secs": 3600 } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{Operation, StateTransition};
use crate::retry::{DEFAULT_CATEGORY, ExponentialBackoff, RetryPolicies, RetryPolicy};
use crate::waiter::{
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, PollSchedule, WaitSpec,
    WaitSpecError,
};

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid polling settings: {0}")]
    Polling(#[from] WaitSpecError),

    #[error("Invalid retry settings for category {category}: {message}")]
    Retry { category: String, message: String },

    #[error(
        "Invalid {scope} {operation} timeout: {secs}s exceeds the maximum of {max}s",
        max = MAX_TIMEOUT_SECS
    )]
    Timeout {
        scope: String,
        operation: Operation,
        secs: u64,
    },
}

/// Per-operation timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub create_secs: u64,
    pub update_secs: u64,
    pub delete_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create_secs: DEFAULT_TIMEOUT_SECS,
            update_secs: DEFAULT_TIMEOUT_SECS,
            delete_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Timeouts {
    pub fn for_operation(&self, operation: Operation) -> Duration {
        let secs = match operation {
            Operation::Create => self.create_secs,
            Operation::Update => self.update_secs,
            Operation::Delete => self.delete_secs,
        };
        Duration::from_secs(secs)
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        for operation in [Operation::Create, Operation::Update, Operation::Delete] {
            let secs = self.for_operation(operation).as_secs();
            if secs > MAX_TIMEOUT_SECS {
                return Err(ConfigError::Timeout {
                    scope: scope.to_string(),
                    operation,
                    secs,
                });
            }
        }
        Ok(())
    }
}

/// Poll schedule settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingSettings {
    pub interval_ms: u64,
    /// Cap for a growing interval; defaults to `interval_ms`
    pub max_interval_ms: Option<u64>,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_interval_ms: None,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl PollingSettings {
    pub fn schedule(&self) -> PollSchedule {
        let interval = Duration::from_millis(self.interval_ms);
        PollSchedule {
            interval,
            max_interval: self
                .max_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(interval),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// Retry settings of one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Maximum consecutive failures (0 = unlimited)
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let backoff = ExponentialBackoff::default();
        Self {
            max_attempts: backoff.max_attempts,
            initial_delay_ms: backoff.initial_delay.as_millis() as u64,
            max_delay_ms: backoff.max_delay.as_millis() as u64,
            multiplier: backoff.multiplier,
            jitter: backoff.jitter,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    fn validate(&self, category: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Retry {
            category: category.to_string(),
            message,
        };
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(invalid(format!("jitter must be in [0, 1), got {}", self.jitter)));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(invalid("max_delay_ms is shorter than initial_delay_ms".into()));
        }
        Ok(())
    }
}

/// Retry category of database kinds
pub const DATABASE_CATEGORY: &str = "database";

/// Retry category of object storage kinds
pub const OBJECT_STORAGE_CATEGORY: &str = "object_storage";

fn default_retry_categories() -> BTreeMap<String, RetrySettings> {
    let mut retry = BTreeMap::new();
    retry.insert(DEFAULT_CATEGORY.to_string(), RetrySettings::default());
    // Databases throttle state reads aggressively while provisioning
    retry.insert(
        DATABASE_CATEGORY.to_string(),
        RetrySettings {
            max_attempts: 12,
            max_delay_ms: 60_000,
            ..Default::default()
        },
    );
    retry.insert(
        OBJECT_STORAGE_CATEGORY.to_string(),
        RetrySettings {
            max_attempts: 5,
            max_delay_ms: 10_000,
            ..Default::default()
        },
    );
    retry
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettleConfig {
    pub timeouts: Timeouts,
    pub polling: PollingSettings,
    /// Retry settings per category; missing categories fall back to "default"
    pub retry: BTreeMap<String, RetrySettings>,
    /// Timeout overrides per resource kind
    pub kind_timeouts: BTreeMap<String, Timeouts>,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            polling: PollingSettings::default(),
            retry: default_retry_categories(),
            kind_timeouts: BTreeMap::new(),
        }
    }
}

impl SettleConfig {
    /// Default config file name
    pub const DEFAULT_FILE: &'static str = "settle.json";

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Load a config file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(content)?;
        // Categories given in the file replace the built-in ones; the rest stay.
        for (category, settings) in default_retry_categories() {
            config.retry.entry(category).or_insert(settings);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate("default")?;
        for (kind, timeouts) in &self.kind_timeouts {
            timeouts.validate(kind)?;
        }
        self.polling.schedule().validate()?;
        for (category, settings) in &self.retry {
            settings.validate(category)?;
        }
        Ok(())
    }

    /// Timeout of an operation on a resource kind
    pub fn timeout_for(&self, kind: &str, operation: Operation) -> Duration {
        self.kind_timeouts
            .get(kind)
            .unwrap_or(&self.timeouts)
            .for_operation(operation)
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        let mut policies = RetryPolicies::default();
        for (category, settings) in &self.retry {
            let policy: Arc<dyn RetryPolicy> = Arc::new(settings.policy());
            policies.insert(category.clone(), policy);
        }
        policies
    }

    /// Build the wait for one operation on one resource kind
    pub fn wait_spec(
        &self,
        kind: &str,
        operation: Operation,
        transition: &StateTransition,
        retry: Arc<dyn RetryPolicy>,
    ) -> Result<WaitSpec, WaitSpecError> {
        let mut builder = WaitSpec::builder()
            .pending(transition.pending.iter().cloned())
            .target(transition.target.iter().cloned())
            .timeout(self.timeout_for(kind, operation))
            .poll_schedule(self.polling.schedule())
            .retry_policy(retry);
        if let Some(state) = &transition.not_found_state {
            builder = builder.not_found_as(state.clone());
        }
        builder.build()
    }
}
