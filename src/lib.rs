//! # Pacer - Adaptive Outbound Pacing for Rust
//!
//! An adaptive outbound-pacing and rate-limiting engine: per-destination
//! token buckets, a context-aware delay calculator, and a closed-loop tuner
//! that rewrites limiter parameters from live traffic metrics.
//!
//! ## Why adaptive pacing?
//!
//! A fixed rate limit is always wrong twice: too tight for a destination
//! that suddenly gets busy, too loose for one that went quiet. This engine
//! watches each destination independently, escalates through burst levels
//! when traffic spikes, and re-derives every bucket's parameters from what
//! actually happened over the last minute.
//!
//! ```text
//!     Token Bucket Visualization:
//!
//!     Time 0:    [🪙🪙🪙🪙🪙] (5 tokens available)
//!     Request 1: [🪙🪙🪙🪙] ✅ (takes 1 token)
//!     Request 2: [🪙🪙🪙] ✅ (takes 1 token)
//!     Time +50ms:[🪙🪙🪙🪙🪙] (refilled)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use pacer::{GroupKey, Pacer, PacerConfig};
//! use std::time::Duration;
//!
//! let pacer = Pacer::with_config(PacerConfig::default());
//! let key = GroupKey::from("chat-42");
//!
//! if pacer.try_acquire(&key) {
//!     // deliver the message
//! } else {
//!     // "not yet" - defer and retry after the reported wait
//!     let _wait = pacer.wait_time(&key);
//! }
//!
//! // Pacing between successive sends to one destination:
//! let delay = pacer.send_delay(false, 240);
//! assert!(delay >= Duration::from_millis(500));
//!
//! // Backoff after a failed API call:
//! let backoff = pacer.retry_delay(2, Duration::from_millis(500), Duration::from_secs(5), 2.0);
//! assert!(backoff <= Duration::from_secs(5));
//!
//! pacer.shutdown();
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                  ┌─────────────────────────┐
//!                  │    Your Dispatcher      │
//!                  └──────────┬──────────────┘
//!                             │
//!                  ┌──────────▼──────────────┐
//!                  │         Pacer           │
//!                  ├─────────────────────────┤
//!                  │  • try_acquire()        │
//!                  │  • wait_time()          │
//!                  │  • send_delay()         │
//!                  │  • retry_delay()        │
//!                  └──────────┬──────────────┘
//!              ┌──────────────┼────────────────┐
//!              │              │                │
//!   ┌──────────▼───────┐ ┌────▼──────────┐ ┌───▼───────────┐
//!   │  GroupLimiter    │ │ DelayCalc     │ │ MetricsColl.  │
//!   ├──────────────────┤ ├───────────────┤ ├───────────────┤
//!   │ • per-key bucket │ │ • send pacing │ │ • aggregates  │
//!   │ • burst levels   │ │ • backoff     │ │ • percentiles │
//!   │ • idle sweep     │ │ • jitter      │ │ • health score│
//!   └──────────▲───────┘ └────▲──────────┘ └───┬───────────┘
//!              │              │                │ reads
//!              └──────── AdaptiveTuner ◄───────┘
//!                    (background thread)
//! ```
//!
//! ## Guarantees
//!
//! - **Non-blocking** - no admission or delay query ever blocks the caller;
//!   contended refills are skipped and recovered on the next call
//! - **Clamped** - every tuned parameter stays inside its documented legal
//!   range, no matter what the metrics say
//! - **Per-key isolation** - destinations cannot starve each other; state
//!   for idle destinations is evicted after a TTL
//! - **A refusal is not an error** - `try_acquire` returning `false` means
//!   "not yet", and callers are expected to defer and retry
//!
//! ## Thread Safety
//!
//! [`Pacer`] is `Send + Sync`; share it via `Arc` across caller threads.
//! One background thread runs the tuning cycle and the idle sweep, and is
//! stopped by [`Pacer::shutdown`].

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Internal module
mod pacing;

// Public re-exports
pub use pacing::{
    cpu_relax, current_time_ms, AdaptiveTuner, BucketSnapshot, BurstConfig, BurstLevel, ConfigError,
    DelayCalculator, DelayConfig, DelayParameters, DelayPercentiles, GroupKey, GroupLimiter,
    GroupMetricsSnapshot, MetricsCollector, PacerConfig, PerformanceStats, TunerHandle,
    CAPACITY_RANGE, DEFAULT_RETRY_REASON, LOAD_FACTOR_RANGE, MAX_REFILL_PERIODS,
    REFILL_INTERVAL_RANGE, REFILL_TOKENS_RANGE,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// A pacer wrapped in `Arc` for convenient thread-safe sharing.
pub type SharedPacer = Arc<Pacer>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
///
/// ```rust
/// use pacer::prelude::*;
///
/// let pacer = Pacer::with_config(PacerConfig::default());
/// assert!(pacer.try_acquire(&GroupKey::from("chat")));
/// pacer.shutdown();
/// ```
pub mod prelude {
    //! Common imports for typical pacing use cases.

    pub use crate::{
        BurstLevel, GroupKey, MetricsCollector, Pacer, PacerBuilder, PacerConfig, PerformanceStats,
        SharedPacer,
    };
}

/// The pacing engine: explicitly wired, dependency-injected service object.
///
/// Construction order is enforced by the wiring itself: the
/// [`MetricsCollector`] is built first, the limiter and delay calculator
/// receive it by `Arc`, and the [`AdaptiveTuner`] receives all three. There
/// is no global or lazily-initialized state.
///
/// # Example
///
/// ```rust
/// use pacer::{GroupKey, Pacer, PacerConfig};
///
/// let pacer = Pacer::with_config(PacerConfig::default());
///
/// let key = GroupKey::from("news-channel");
/// let mut admitted = 0;
/// for _ in 0..25 {
///     if pacer.try_acquire(&key) {
///         admitted += 1;
///     }
/// }
/// assert_eq!(admitted, 20); // base capacity
///
/// let report = pacer.generate_report();
/// assert!(report.contains("Total Requests: 25"));
/// pacer.shutdown();
/// ```
#[derive(Debug)]
pub struct Pacer {
    metrics: Arc<MetricsCollector>,
    limiter: Arc<GroupLimiter>,
    delays: Arc<DelayCalculator>,
    tuner: Arc<AdaptiveTuner>,
    tuner_handle: Mutex<Option<TunerHandle>>,
}

impl Pacer {
    /// Builds and starts an engine with the given configuration.
    ///
    /// Spawns the background tuner thread; call [`shutdown`](Self::shutdown)
    /// to stop it.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid (see [`PacerConfig::validate`]).
    /// Use [`PacerBuilder::try_build`] to handle errors instead.
    pub fn with_config(config: PacerConfig) -> Self {
        config.validate().expect("Invalid pacer configuration");

        let metrics = Arc::new(MetricsCollector::new());
        let limiter = Arc::new(GroupLimiter::new(config.clone(), metrics.clone()));
        let delays = Arc::new(DelayCalculator::new(&config.delay, metrics.clone()));
        let tuner = Arc::new(AdaptiveTuner::new(
            limiter.clone(),
            delays.clone(),
            metrics.clone(),
            config,
        ));
        let handle = tuner.clone().spawn();

        Self {
            metrics,
            limiter,
            delays,
            tuner,
            tuner_handle: Mutex::new(Some(handle)),
        }
    }

    /// Asks "may I send to `key` now?". Non-blocking; a refusal means
    /// "not yet".
    #[inline]
    pub fn try_acquire(&self, key: &GroupKey) -> bool {
        self.limiter.try_acquire(key)
    }

    /// Time until a token is expected for `key`; zero when one is
    /// available now.
    #[inline]
    pub fn wait_time(&self, key: &GroupKey) -> Duration {
        self.limiter.wait_time(key)
    }

    /// Pacing delay before the next send to the same destination.
    #[inline]
    pub fn send_delay(&self, is_media: bool, content_length: usize) -> Duration {
        self.delays.send_delay(is_media, content_length)
    }

    /// Smoothed exponential backoff for a failed operation.
    #[inline]
    pub fn retry_delay(
        &self,
        retry_count: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Duration {
        self.delays
            .retry_delay(retry_count, base_delay, max_delay, backoff_multiplier)
    }

    /// Backoff attributed to a specific reason in the metrics.
    #[inline]
    pub fn retry_delay_tagged(
        &self,
        reason: &str,
        retry_count: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Duration {
        self.delays.retry_delay_tagged(
            reason,
            retry_count,
            base_delay,
            max_delay,
            backoff_multiplier,
        )
    }

    /// Aggregate engine statistics.
    pub fn performance_stats(&self) -> PerformanceStats {
        self.metrics.performance_stats()
    }

    /// Metrics for one destination, if it has been seen.
    pub fn group_metrics(&self, key: &GroupKey) -> Option<GroupMetricsSnapshot> {
        self.metrics.group_snapshot(key, current_time_ms())
    }

    /// Live bucket state for one destination, if it has been seen.
    pub fn bucket_snapshot(&self, key: &GroupKey) -> Option<BucketSnapshot> {
        self.limiter.bucket_snapshot(key)
    }

    /// Human-readable operational report.
    pub fn generate_report(&self) -> String {
        self.metrics.generate_report()
    }

    /// Composite health score, 0-100.
    pub fn health_score(&self) -> u8 {
        self.metrics.health_score()
    }

    /// Current delay parameters.
    pub fn delay_parameters(&self) -> DelayParameters {
        self.delays.parameters()
    }

    /// The shared collector, for collaborators that record queue depth,
    /// retry outcomes or actual sends.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Enables or disables adaptive adjustment at runtime.
    pub fn set_adaptive_adjustment_enabled(&self, enabled: bool) {
        self.tuner.set_enabled(enabled);
    }

    /// Overrides the global load factor (clamped to its legal range).
    pub fn set_global_load_factor(&self, factor: f64) {
        self.tuner.set_load_factor(factor);
    }

    /// Current global load factor.
    pub fn global_load_factor(&self) -> f64 {
        self.tuner.load_factor()
    }

    /// Drops all pacing state for one destination.
    pub fn reset_group(&self, key: &GroupKey) {
        self.limiter.reset_group(key);
    }

    /// Drops all per-destination pacing state.
    pub fn clear_all(&self) {
        self.limiter.clear_all();
    }

    /// Clears every recorded metric (administrative/test use).
    pub fn reset_all_metrics(&self) {
        self.metrics.reset_all_metrics();
    }

    /// Stops the background tuner thread, waiting for an in-flight cycle.
    ///
    /// Bucket state is retained; admissions keep working after shutdown,
    /// they just stop being re-tuned. Calling this twice is a no-op.
    pub fn shutdown(&self) {
        if let Some(handle) = self.tuner_handle.lock().take() {
            handle.shutdown();
        }
    }
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Pacer`] with validated configuration.
///
/// # Example
///
/// ```rust
/// use pacer::PacerBuilder;
///
/// let pacer = PacerBuilder::new()
///     .base_capacity(40)
///     .base_refill_interval_ms(100)
///     .base_refill_tokens(5)
///     .tuner_cycle_ms(10_000)
///     .build();
/// pacer.shutdown();
///
/// // Invalid configuration surfaces as an error from try_build():
/// let result = PacerBuilder::new().base_capacity(0).try_build();
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct PacerBuilder {
    config: PacerConfig,
}

impl PacerBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: PacerConfig::default(),
        }
    }

    /// Sets the baseline token capacity per destination.
    pub fn base_capacity(mut self, capacity: u64) -> Self {
        self.config.base_capacity = capacity;
        self
    }

    /// Sets the baseline refill interval in milliseconds.
    pub fn base_refill_interval_ms(mut self, ms: u64) -> Self {
        self.config.base_refill_interval_ms = ms;
        self
    }

    /// Sets the baseline tokens added per refill interval.
    pub fn base_refill_tokens(mut self, tokens: u64) -> Self {
        self.config.base_refill_tokens = tokens;
        self
    }

    /// Overrides the burst detection settings.
    pub fn burst(mut self, burst: BurstConfig) -> Self {
        self.config.burst = burst;
        self
    }

    /// Overrides the delay calculator settings.
    pub fn delay(mut self, delay: DelayConfig) -> Self {
        self.config.delay = delay;
        self
    }

    /// Sets how long an idle destination keeps its state, in milliseconds.
    pub fn inactivity_ttl_ms(mut self, ms: u64) -> Self {
        self.config.inactivity_ttl_ms = ms;
        self
    }

    /// Sets the tuner cycle interval in milliseconds.
    pub fn tuner_cycle_ms(mut self, ms: u64) -> Self {
        self.config.tuner_cycle_ms = ms;
        self
    }

    /// Sets the UTC peak-hour range and its multipliers.
    pub fn peak_hours(mut self, start: u8, end: u8, peak: f64, off_peak: f64) -> Self {
        self.config.peak_hours = (start, end);
        self.config.peak_multiplier = peak;
        self.config.off_peak_multiplier = off_peak;
        self
    }

    /// Builds and starts the engine.
    ///
    /// # Panics
    ///
    /// Panics on invalid configuration; use
    /// [`try_build`](Self::try_build) to handle errors.
    pub fn build(self) -> Pacer {
        Pacer::with_config(self.config)
    }

    /// Builds and starts the engine, returning an error on invalid
    /// configuration.
    pub fn try_build(self) -> Result<Pacer, ConfigError> {
        self.config.validate()?;
        Ok(Pacer::with_config(self.config))
    }
}
