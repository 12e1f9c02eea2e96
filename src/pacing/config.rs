//! Configuration for the pacing engine.
//!
//! Everything tunable lives here: baseline token-bucket parameters, burst
//! detection thresholds, delay calculator intervals, and the background
//! tuner schedule. The adaptive tuner rewrites the *live* per-group
//! parameters at runtime, but always derives them from the baselines in
//! this module and clamps them to the documented legal ranges.
//!
//! ```text
//!     Parameter ranges (enforced by clamping, never by panics):
//!
//!     capacity            [2, 100]   tokens
//!     refill interval     [30, 3000] ms
//!     refill tokens       [1, 20]    per interval
//!     global load factor  [0.5, 2.0]
//! ```

use std::time::Duration;

use thiserror::Error;

/// Maximum number of refill periods to process at once.
///
/// Prevents a bucket that sat idle for a long time from doing unbounded
/// arithmetic when it wakes up; the token cap makes larger values
/// meaningless anyway.
pub const MAX_REFILL_PERIODS: u64 = 100;

/// Legal range for a bucket's token capacity.
pub const CAPACITY_RANGE: (u64, u64) = (2, 100);

/// Legal range for a bucket's refill interval in milliseconds.
pub const REFILL_INTERVAL_RANGE: (u64, u64) = (30, 3000);

/// Legal range for the number of tokens added per refill interval.
pub const REFILL_TOKENS_RANGE: (u64, u64) = (1, 20);

/// Legal range for the global load factor.
pub const LOAD_FACTOR_RANGE: (f64, f64) = (0.5, 2.0);

/// Clamps a capacity value to [`CAPACITY_RANGE`].
#[inline]
pub(crate) fn clamp_capacity(v: u64) -> u64 {
    v.clamp(CAPACITY_RANGE.0, CAPACITY_RANGE.1)
}

/// Clamps a refill interval to [`REFILL_INTERVAL_RANGE`].
#[inline]
pub(crate) fn clamp_refill_interval(v: u64) -> u64 {
    v.clamp(REFILL_INTERVAL_RANGE.0, REFILL_INTERVAL_RANGE.1)
}

/// Clamps a refill token count to [`REFILL_TOKENS_RANGE`].
#[inline]
pub(crate) fn clamp_refill_tokens(v: u64) -> u64 {
    v.clamp(REFILL_TOKENS_RANGE.0, REFILL_TOKENS_RANGE.1)
}

/// Clamps a load factor to [`LOAD_FACTOR_RANGE`].
#[inline]
pub(crate) fn clamp_load_factor(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(LOAD_FACTOR_RANGE.0, LOAD_FACTOR_RANGE.1)
    } else {
        1.0
    }
}

/// Errors produced when validating a [`PacerConfig`].
///
/// Out-of-range values are normally clamped rather than rejected; the
/// variants here cover the configurations that cannot be repaired by
/// clamping because they would make the engine degenerate (a bucket that
/// never refills, a delay window that is empty).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The baseline capacity is zero.
    #[error("base_capacity must be greater than 0")]
    ZeroCapacity,

    /// The baseline refill interval is zero.
    #[error("base_refill_interval_ms must be greater than 0")]
    ZeroRefillInterval,

    /// The baseline refill amount is zero.
    #[error("base_refill_tokens must be greater than 0")]
    ZeroRefillTokens,

    /// Burst thresholds must be strictly increasing.
    #[error("burst thresholds must be strictly increasing, got {0:?}")]
    NonIncreasingThresholds([u32; 3]),

    /// The burst detection window is zero.
    #[error("burst window_ms must be greater than 0")]
    ZeroBurstWindow,

    /// The minimum send interval exceeds the maximum.
    #[error("delay min_interval_ms ({min}) exceeds max_interval_ms ({max})")]
    InvertedDelayBounds {
        /// Configured minimum interval in milliseconds.
        min: u64,
        /// Configured maximum interval in milliseconds.
        max: u64,
    },

    /// The tuner cycle is zero.
    #[error("tuner_cycle_ms must be greater than 0")]
    ZeroTunerCycle,
}

/// Burst detection parameters.
///
/// A group escalates through burst levels when the number of requests seen
/// inside the sliding detection window crosses the per-level thresholds,
/// and de-escalates when traffic falls off or the burst has run too long.
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Sliding detection window in milliseconds.
    pub window_ms: u64,

    /// Window request counts that trigger Burst / Super / Extreme.
    pub thresholds: [u32; 3],

    /// Maximum time a group may stay elevated before being forced back to
    /// the baseline, in milliseconds.
    pub max_duration_ms: u64,
}

impl Default for BurstConfig {
    /// 30/50/80 requests per 6 second window, 20 second ceiling.
    fn default() -> Self {
        Self {
            window_ms: 6_000,
            thresholds: [30, 50, 80],
            max_duration_ms: 20_000,
        }
    }
}

/// Delay calculator parameters.
///
/// `text_interval_ms` and `media_interval_ms` are the baselines the tuner
/// scales with the global load factor; every computed delay is clamped to
/// `[min_interval_ms, max_interval_ms]`.
#[derive(Debug, Clone)]
pub struct DelayConfig {
    /// Base pacing interval between text sends, in milliseconds.
    pub text_interval_ms: u64,

    /// Base pacing interval between media sends, in milliseconds.
    pub media_interval_ms: u64,

    /// Lower clamp for any computed send delay, in milliseconds.
    pub min_interval_ms: u64,

    /// Upper clamp for any computed send delay, in milliseconds.
    pub max_interval_ms: u64,
}

impl Default for DelayConfig {
    /// 1 s between texts, 3 s between media, clamped to [500 ms, 10 s].
    fn default() -> Self {
        Self {
            text_interval_ms: 1_000,
            media_interval_ms: 3_000,
            min_interval_ms: 500,
            max_interval_ms: 10_000,
        }
    }
}

/// Top-level configuration for a [`Pacer`](crate::Pacer).
///
/// All fields have sensible defaults; override only what you need:
///
/// ```rust
/// use pacer::PacerConfig;
///
/// let config = PacerConfig {
///     base_capacity: 40,
///     tuner_cycle_ms: 10_000,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Baseline token capacity per group.
    pub base_capacity: u64,

    /// Baseline refill interval per group, in milliseconds.
    pub base_refill_interval_ms: u64,

    /// Baseline tokens added per refill interval.
    pub base_refill_tokens: u64,

    /// Burst detection settings.
    pub burst: BurstConfig,

    /// Delay calculator settings.
    pub delay: DelayConfig,

    /// How long a group may sit idle before the sweep evicts its state,
    /// in milliseconds.
    pub inactivity_ttl_ms: u64,

    /// Interval between adaptive tuner cycles, in milliseconds.
    pub tuner_cycle_ms: u64,

    /// Peak traffic hours as a UTC `[start, end)` hour pair. A wrapped
    /// range (e.g. `(22, 6)`) spans midnight.
    pub peak_hours: (u8, u8),

    /// Tuning multiplier applied during peak hours.
    pub peak_multiplier: f64,

    /// Tuning multiplier applied outside peak hours.
    pub off_peak_multiplier: f64,
}

impl Default for PacerConfig {
    /// Defaults from the engine's reference deployment: 20 token capacity,
    /// 4 tokens per 50 ms, 10 minute inactivity TTL, 30 second tuner cycle.
    fn default() -> Self {
        Self {
            base_capacity: 20,
            base_refill_interval_ms: 50,
            base_refill_tokens: 4,
            burst: BurstConfig::default(),
            delay: DelayConfig::default(),
            inactivity_ttl_ms: 600_000,
            tuner_cycle_ms: 30_000,
            peak_hours: (9, 22),
            peak_multiplier: 1.2,
            off_peak_multiplier: 0.9,
        }
    }
}

impl PacerConfig {
    /// Validates the configuration.
    ///
    /// Values that can be repaired by clamping are not errors; only
    /// degenerate configurations are rejected.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`] for the rejected shapes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pacer::PacerConfig;
    ///
    /// let config = PacerConfig {
    ///     base_capacity: 0,
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.base_refill_interval_ms == 0 {
            return Err(ConfigError::ZeroRefillInterval);
        }
        if self.base_refill_tokens == 0 {
            return Err(ConfigError::ZeroRefillTokens);
        }
        if self.burst.window_ms == 0 {
            return Err(ConfigError::ZeroBurstWindow);
        }
        let [t1, t2, t3] = self.burst.thresholds;
        if !(t1 < t2 && t2 < t3) {
            return Err(ConfigError::NonIncreasingThresholds(self.burst.thresholds));
        }
        if self.delay.min_interval_ms > self.delay.max_interval_ms {
            return Err(ConfigError::InvertedDelayBounds {
                min: self.delay.min_interval_ms,
                max: self.delay.max_interval_ms,
            });
        }
        if self.tuner_cycle_ms == 0 {
            return Err(ConfigError::ZeroTunerCycle);
        }
        Ok(())
    }

    /// The tuner cycle as a [`Duration`].
    #[inline]
    pub fn tuner_cycle(&self) -> Duration {
        Duration::from_millis(self.tuner_cycle_ms)
    }

    /// Returns true when `hour_utc` falls inside the configured peak range.
    ///
    /// Handles wrapped ranges, so `(22, 6)` covers late evening through
    /// early morning.
    pub(crate) fn is_peak_hour(&self, hour_utc: u8) -> bool {
        let (start, end) = self.peak_hours;
        if start <= end {
            hour_utc >= start && hour_utc < end
        } else {
            hour_utc >= start || hour_utc < end
        }
    }
}
