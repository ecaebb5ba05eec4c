//! Per-block reliability settings: exponential retry with jitter, and the
//! invocation timeout. Both read from the block's params and fall back to
//! engine defaults.

use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 30_000;

/// Exponential retry policy applied around every handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first execution.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Exponential multiplier per retry step.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Symmetric jitter fraction applied to each computed backoff.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: 0.0,
        }
    }

    /// Read the policy from a block's `retry` param, falling back to defaults
    /// for anything absent or malformed.
    pub fn from_params(params: &Map<String, Value>) -> Self {
        params
            .get("retry")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn can_retry(&self, attempts_done: u32) -> bool {
        attempts_done < self.max_attempts
    }

    /// Backoff before attempt `attempts_done + 1`, with jitter applied.
    pub fn backoff_duration(&self, attempts_done: u32) -> Duration {
        let retries_done = attempts_done.saturating_sub(1);
        let exp = self.backoff_factor.powi(retries_done as i32);
        let base = (self.initial_backoff_ms as f64 * exp).round();
        let clamped = base.min(self.max_backoff_ms.max(1) as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = self.jitter.min(1.0);
            let factor = 1.0 + rand::rng().random_range(-spread..=spread);
            clamped * factor
        } else {
            clamped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Per-block invocation timeout from the `timeoutMs` param (default 30s).
pub fn block_timeout(params: &Map<String, Value>) -> Duration {
    let ms = params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .filter(|ms| *ms > 0)
        .unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS);
    Duration::from_millis(ms)
}
