//! Retry policy for activity execution

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Arithmetic growth: `min * (1 + factor * k)`.
    Linear,

    /// Geometric growth: `min * factor^k`.
    Exponential,
}

/// Configuration for activity retries.
///
/// The delay before retry `k` (0-based) is the strategy's growth formula
/// clamped into `[min, max]`, then scaled by `1 + uniform(-jitter, +jitter)`.
///
/// # Example
///
/// ```
/// use fleuve_engine::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_min(Duration::from_secs(1))
///     .with_max(Duration::from_secs(60));
///
/// // First retry after ~1 second, then ~2s, ~4s, ...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. An always-failing activity runs
    /// `max_retries + 1` times before dead-lettering.
    pub max_retries: u32,

    /// Growth strategy.
    pub strategy: BackoffStrategy,

    /// Growth factor (2.0 doubles each retry under `Exponential`).
    pub factor: f64,

    /// Smallest delay between attempts.
    #[serde(with = "duration_millis")]
    pub min: Duration,

    /// Largest delay between attempts.
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Randomness in `[0, 1]`; 0.1 means each delay varies by up to 10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults: 5 retries, 1s..60s,
    /// doubling, 10% jitter.
    pub fn exponential() -> Self {
        Self {
            max_retries: 5,
            strategy: BackoffStrategy::Exponential,
            factor: 2.0,
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }

    /// Linear backoff: 5 retries, 1s, 2s, 3s, ... capped at 60s.
    pub fn linear() -> Self {
        Self {
            max_retries: 5,
            strategy: BackoffStrategy::Linear,
            factor: 1.0,
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            strategy: BackoffStrategy::Linear,
            factor: 0.0,
            min: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_min(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `k` (0-based: `k = 0` follows the first failed
    /// attempt).
    pub fn delay_for_retry(&self, k: u32) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Exponential => self.min.as_secs_f64() * self.factor.powi(k as i32),
            BackoffStrategy::Linear => self.min.as_secs_f64() * (1.0 + self.factor * k as f64),
        };
        let clamped = base.clamp(self.min.as_secs_f64(), self.max.as_secs_f64().max(self.min.as_secs_f64()));

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let scale = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
            (clamped * scale).max(0.0)
        } else {
            clamped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether retry `k` (0-based) is still within budget.
    pub fn allows_retry(&self, k: u32) -> bool {
        k < self.max_retries
    }
}
