//! Internal implementation of the pacing engine.
//!
//! ```text
//!     pacing/
//!     ├── mod.rs      (You are here - module organization)
//!     ├── config.rs   (Tunables, legal ranges, validation)
//!     ├── bucket.rs   (Per-group token bucket + burst state machine)
//!     ├── limiter.rs  (Per-destination admission control)
//!     ├── delay.rs    (Send pacing and retry backoff)
//!     ├── metrics.rs  (Metrics collection and health scoring)
//!     ├── tuner.rs    (Closed-loop adaptive tuning)
//!     └── utils.rs    (Clock and CPU helpers)
//! ```
//!
//! ## Control flow
//!
//! ```text
//!     caller ──► GroupLimiter ──► GroupBucket (refill → consume)
//!        │             │
//!        │             ▼
//!        │      MetricsCollector ◄── DelayCalculator
//!        │             ▲
//!        ▼             │ reads aggregates
//!     DelayCalculator  │
//!                AdaptiveTuner ──► rewrites bucket + delay parameters
//! ```

// Declare submodules (internal organization)
mod bucket;
mod config;
mod delay;
mod limiter;
mod metrics;
mod tuner;
mod utils;

/// Configuration types and validation
pub use config::{
    BurstConfig, ConfigError, DelayConfig, PacerConfig, CAPACITY_RANGE, LOAD_FACTOR_RANGE,
    MAX_REFILL_PERIODS, REFILL_INTERVAL_RANGE, REFILL_TOKENS_RANGE,
};

/// Per-group bucket state exposed for reporting
pub use bucket::{BucketSnapshot, BurstLevel};

/// Per-destination admission control
pub use limiter::{GroupKey, GroupLimiter};

/// Send pacing and retry backoff
pub use delay::{DelayCalculator, DelayParameters, DEFAULT_RETRY_REASON};

/// Metrics collection and health scoring
pub use metrics::{DelayPercentiles, GroupMetricsSnapshot, MetricsCollector, PerformanceStats};

/// Closed-loop adaptive tuning
pub use tuner::{AdaptiveTuner, TunerHandle};

/// Clock and CPU helpers shared with callers
pub use utils::{cpu_relax, current_time_ms};
