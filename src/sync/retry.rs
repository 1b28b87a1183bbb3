//! Retry policy for outgoing mutations
//!
//! Exponential backoff with jitter:
//! `wait = 2^min(attempt, max_exponent) * base_delay + uniform(0..=jitter)`

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::api::NetworkErrorCode;

/// Whether (and when) to retry a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRetryAdvice {
    pub should_retry: bool,
    pub retry_interval: Duration,
}

impl RequestRetryAdvice {
    pub fn retry_after(interval: Duration) -> Self {
        Self {
            should_retry: true,
            retry_interval: interval,
        }
    }

    pub fn immediately() -> Self {
        Self::retry_after(Duration::ZERO)
    }

    pub fn no_retry(interval: Duration) -> Self {
        Self {
            should_retry: false,
            retry_interval: interval,
        }
    }
}

/// The observed failure a retry decision is based on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrigger {
    Network(NetworkErrorCode),
    HttpStatus {
        status: u16,
        retry_after: Option<Duration>,
    },
}

pub trait RequestRetryablePolicy: Send + Sync {
    fn retry_request_advice(&self, trigger: &RetryTrigger, attempt_number: u32) -> RequestRetryAdvice;
}

/// Backoff tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    /// HTTP retries stop once the computed wait exceeds this
    pub max_wait_ms: u64,
    pub max_exponent: u32,
    pub default_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            jitter_ms: 100,
            max_wait_ms: 300_000,
            max_exponent: 31,
            default_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
}

impl DefaultRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn wait_millis(&self, attempt_number: u32) -> u64 {
        let exponent = attempt_number.min(self.config.max_exponent).min(63);
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        (1u64 << exponent)
            .saturating_mul(self.config.base_delay_ms)
            .saturating_add(jitter)
    }

    fn default_advice(&self) -> RequestRetryAdvice {
        RequestRetryAdvice::no_retry(Duration::from_secs(self.config.default_interval_secs))
    }

    fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..=599).contains(&status)
    }
}

impl RequestRetryablePolicy for DefaultRetryPolicy {
    fn retry_request_advice(&self, trigger: &RetryTrigger, attempt_number: u32) -> RequestRetryAdvice {
        match trigger {
            RetryTrigger::Network(code) if code.is_retryable() => {
                RequestRetryAdvice::retry_after(Duration::from_millis(self.wait_millis(attempt_number)))
            }
            RetryTrigger::Network(_) => self.default_advice(),
            RetryTrigger::HttpStatus { status, retry_after } if Self::is_retryable_status(*status) => {
                if let Some(retry_after) = retry_after {
                    return RequestRetryAdvice::retry_after(*retry_after);
                }
                let wait = self.wait_millis(attempt_number);
                if wait > self.config.max_wait_ms {
                    return self.default_advice();
                }
                RequestRetryAdvice::retry_after(Duration::from_millis(wait))
            }
            RetryTrigger::HttpStatus { .. } => self.default_advice(),
        }
    }
}
