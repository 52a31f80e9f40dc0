//! Retry budgets with exponential backoff.
//!
//! A budget comes either from a matching `retry` policy rule or from the
//! route's `retries` setting. Transport errors and timeouts are always
//! retryable; upstream statuses only when listed.

use crate::config::PolicyAction;
use crate::error::MeshError;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Statuses retried when a rule does not list its own.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 3] = [502, 503, 504];

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding the initial request).
    pub max_retries: u32,
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub use_jitter: bool,
    /// HTTP status codes that should trigger a retry.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Budget taken from a route's `retries` setting.
    pub fn for_route(retries: u32) -> Self {
        Self::default().with_max_retries(retries)
    }

    /// Budget taken from a `retry` policy action. Returns `None` for other
    /// actions.
    pub fn from_action(action: &PolicyAction) -> Option<Self> {
        match action {
            PolicyAction::Retry {
                attempts,
                backoff_ms,
                retry_on,
            } => {
                let mut config = Self::default()
                    .with_max_retries(*attempts)
                    .with_base_delay(Duration::from_millis(*backoff_ms));
                if !retry_on.is_empty() {
                    config = config.with_retryable_status_codes(retry_on.clone());
                }
                Some(config)
            }
            _ => None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub fn with_retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }

    /// Checks if a status code should trigger a retry.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }
}

/// Retry state for one routed request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of retries taken so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn has_remaining_retries(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    /// Calculates the delay for the next retry attempt.
    pub fn next_delay(&self) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let multiplier = self.config.backoff_multiplier.powi(self.attempt as i32);
        let delay_ms = (base_ms * multiplier).min(self.config.max_delay.as_millis() as f64);

        let delay_ms = if self.config.use_jitter {
            // Between 0.5x and 1.5x the delay
            delay_ms * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Records a retry attempt and returns the delay to wait, or `None` if
    /// the budget is spent.
    pub fn record_retry(&mut self) -> Option<Duration> {
        if !self.has_remaining_retries() {
            return None;
        }

        let delay = self.next_delay();
        self.attempt += 1;

        debug!(
            attempt = self.attempt,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );

        Some(delay)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.has_remaining_retries() && self.config.is_retryable_status(status)
    }

    /// Checks if a failed attempt should be retried.
    ///
    /// Upstream errors without a status (connect failures, resets, timeouts)
    /// are retryable; errors carrying a status follow the status list. Every
    /// other error is final.
    pub fn should_retry_error(&self, error: &MeshError) -> bool {
        if !self.has_remaining_retries() {
            return false;
        }
        match error {
            MeshError::Upstream { status: None, .. } => true,
            MeshError::Upstream {
                status: Some(status),
                ..
            } => self.config.is_retryable_status(*status),
            _ => false,
        }
    }
}
