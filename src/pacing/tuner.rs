//! Closed-loop adaptive tuning.
//!
//! A background thread wakes every cycle (default 30 s), reads the
//! aggregates the [`MetricsCollector`] accumulated, and rewrites the live
//! parameters of every group bucket and the delay calculator:
//!
//! ```text
//!     Per-cycle pipeline:
//!
//!     avg admission wait ──► global load factor (×1.10 / ×0.95, clamped)
//!     wall clock ──────────► time-of-day multiplier
//!     per group:
//!       frequency tier × success tier × load × time-of-day × burst
//!         │
//!         ▼ damped by recent adjustment history
//!       capacity  = base × f          (clamped [2, 100])
//!       interval  = base / √f         (clamped [30, 3000])
//!       refill    = base × √f         (clamped [1, 20])
//! ```
//!
//! A failure while adjusting one group is logged and never aborts the rest
//! of the cycle. The same thread also runs burst-level maintenance and the
//! idle-key sweep, so state for quiet destinations decays even when no
//! caller touches them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::bucket::GroupBucket;
use super::config::{clamp_load_factor, PacerConfig};
use super::delay::DelayCalculator;
use super::limiter::{GroupKey, GroupLimiter};
use super::metrics::MetricsCollector;
use super::utils::current_time_ms;

/// Adjustment-history retention, in milliseconds.
const HISTORY_RETENTION_MS: u64 = 600_000;

/// Window of history considered when damping new adjustments.
const DAMPING_WINDOW_MS: u64 = 300_000;

/// Hard cap on retained history entries.
const MAX_HISTORY_ENTRIES: usize = 4096;

/// Recent-average factor above which new factors are damped down.
const DAMPING_HIGH: f64 = 1.5;

/// Recent-average factor below which new factors are nudged up.
const DAMPING_LOW: f64 = 0.7;

/// Average admission wait that raises the load factor, in milliseconds.
const LOAD_RAISE_WAIT_MS: f64 = 1_000.0;

/// Average admission wait that lowers the load factor, in milliseconds.
const LOAD_DROP_WAIT_MS: f64 = 100.0;

/// Failure adjusting a single group; the cycle logs it and moves on.
#[derive(Debug, Error)]
pub(crate) enum TuneError {
    /// The combined multiplier degenerated (NaN, infinite or non-positive).
    #[error("computed adjustment factor {0} is not usable")]
    BadFactor(f64),
}

/// Frequency-tier multiplier from a group's requests-per-minute.
#[inline]
fn frequency_multiplier(per_minute: f64) -> f64 {
    if per_minute > 20.0 {
        2.5
    } else if per_minute > 10.0 {
        1.5
    } else if per_minute < 4.0 {
        0.8
    } else {
        1.0
    }
}

/// Success-rate multiplier: struggling groups get headroom, stable ones
/// can shrink.
#[inline]
fn success_multiplier(success_rate: f64) -> f64 {
    if success_rate < 0.8 {
        1.2
    } else if success_rate > 0.95 {
        0.9
    } else {
        1.0
    }
}

/// Periodic parameter tuner.
///
/// Constructed after the limiter, delay calculator and collector, and
/// wired to them by `Arc`. Spawn the background thread with
/// [`spawn`](Self::spawn); admin entry points
/// ([`set_enabled`](Self::set_enabled),
/// [`set_load_factor`](Self::set_load_factor)) may be called at any time.
pub struct AdaptiveTuner {
    limiter: Arc<GroupLimiter>,
    delays: Arc<DelayCalculator>,
    metrics: Arc<MetricsCollector>,
    config: PacerConfig,

    enabled: AtomicBool,
    load_factor_bits: AtomicU64,
    history: Mutex<VecDeque<(u64, f64)>>,
}

impl AdaptiveTuner {
    /// Creates a tuner with a neutral load factor, tuning enabled.
    pub fn new(
        limiter: Arc<GroupLimiter>,
        delays: Arc<DelayCalculator>,
        metrics: Arc<MetricsCollector>,
        config: PacerConfig,
    ) -> Self {
        Self {
            limiter,
            delays,
            metrics,
            config,
            enabled: AtomicBool::new(true),
            load_factor_bits: AtomicU64::new(1.0_f64.to_bits()),
            history: Mutex::new(VecDeque::with_capacity(128)),
        }
    }

    /// Enables or disables adaptive adjustment.
    ///
    /// Burst maintenance and the idle sweep keep running while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        info!(enabled, "adaptive adjustment toggled");
    }

    /// Whether adaptive adjustment currently runs.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Current global load factor.
    pub fn load_factor(&self) -> f64 {
        f64::from_bits(self.load_factor_bits.load(Ordering::Acquire))
    }

    /// Overrides the global load factor (clamped to [0.5, 2.0]).
    pub fn set_load_factor(&self, factor: f64) {
        let clamped = clamp_load_factor(factor);
        self.load_factor_bits
            .store(clamped.to_bits(), Ordering::Release);
        debug!(factor = clamped, "load factor set");
    }

    /// Runs one tuning cycle.
    ///
    /// Exposed for the background thread and for tests; calling it
    /// concurrently with admissions is safe.
    pub fn run_cycle(&self) {
        let now = current_time_ms();

        if self.is_enabled() {
            self.update_load_factor();
            let load = self.load_factor();
            let time_of_day = self.time_of_day_multiplier(now);
            let damping = self.recent_history_bias(now);

            let buckets = self.limiter.buckets_snapshot();
            let mut applied = 0usize;
            for (key, bucket) in &buckets {
                match self.adjust_group(key, bucket, now, load, time_of_day, damping) {
                    Ok(Some(factor)) => {
                        self.record_factor(now, factor);
                        applied += 1;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(%key, %error, "group adjustment failed, continuing cycle");
                    }
                }
            }

            self.delays.scale_with_load(load);
            self.purge_history(now);
            debug!(
                groups = buckets.len(),
                applied,
                load,
                time_of_day,
                damping,
                "tuning cycle finished"
            );
        }

        self.limiter.maintain_all();
        let swept = self.limiter.sweep_idle();
        if swept > 0 {
            debug!(swept, "idle groups removed by tuner cycle");
        }
    }

    /// Spawns the background cycle thread.
    ///
    /// The thread sleeps on a stop channel, so shutdown interrupts an idle
    /// wait immediately; an in-flight cycle finishes before the thread
    /// exits.
    pub fn spawn(self: Arc<Self>) -> TunerHandle {
        let tuner = self;
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("pacer-tuner".to_string())
            .spawn(move || {
                info!(
                    cycle_ms = tuner.config.tuner_cycle_ms,
                    "adaptive tuner started"
                );
                loop {
                    match stop_rx.recv_timeout(tuner.config.tuner_cycle()) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            info!("adaptive tuner stopping");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => tuner.run_cycle(),
                    }
                }
            })
            .expect("failed to spawn tuner thread");

        TunerHandle {
            handle: Some(handle),
            stop_tx,
        }
    }

    // ------------------------------------------------------------------
    // Cycle steps
    // ------------------------------------------------------------------

    /// Nudges the load factor from the average admission wait.
    fn update_load_factor(&self) {
        let avg_wait = self.metrics.avg_admission_wait_ms();
        let current = self.load_factor();
        let next = if avg_wait > LOAD_RAISE_WAIT_MS {
            current * 1.10
        } else if avg_wait < LOAD_DROP_WAIT_MS {
            current * 0.95
        } else {
            current
        };
        let clamped = clamp_load_factor(next);
        if clamped != current {
            self.load_factor_bits
                .store(clamped.to_bits(), Ordering::Release);
            debug!(avg_wait, from = current, to = clamped, "load factor adjusted");
        }
    }

    fn time_of_day_multiplier(&self, now_ms: u64) -> f64 {
        let hour_utc = ((now_ms / 3_600_000) % 24) as u8;
        if self.config.is_peak_hour(hour_utc) {
            self.config.peak_multiplier
        } else {
            self.config.off_peak_multiplier
        }
    }

    /// Recomputes one group's live parameters from its metrics.
    ///
    /// Returns the applied factor, or `None` when the group has no metrics
    /// yet (nothing to base an adjustment on).
    fn adjust_group(
        &self,
        key: &GroupKey,
        bucket: &Arc<GroupBucket>,
        now_ms: u64,
        load: f64,
        time_of_day: f64,
        damping: f64,
    ) -> Result<Option<f64>, TuneError> {
        let Some(group) = self.metrics.group_snapshot(key, now_ms) else {
            return Ok(None);
        };

        let mut factor = frequency_multiplier(group.frequency_per_minute)
            * success_multiplier(group.success_rate)
            * load
            * time_of_day;

        let level = bucket.level();
        if level.is_elevated() {
            factor *= level.refill_multiplier();
        }
        factor *= damping;

        if !factor.is_finite() || factor <= 0.0 {
            return Err(TuneError::BadFactor(factor));
        }

        let (base_capacity, base_interval, base_refill) = bucket.baseline();
        let capacity = (base_capacity as f64 * factor).round() as u64;
        let interval = (base_interval as f64 / factor.sqrt()).round() as u64;
        let refill = (base_refill as f64 * factor.sqrt()).round() as u64;
        bucket.apply_tuning(capacity, interval, refill);

        Ok(Some(factor))
    }

    /// Damping bias from the last five minutes of applied factors.
    fn recent_history_bias(&self, now_ms: u64) -> f64 {
        let history = self.history.lock();
        let cutoff = now_ms.saturating_sub(DAMPING_WINDOW_MS);
        let (sum, count) = history
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .fold((0.0, 0usize), |(s, c), (_, f)| (s + f, c + 1));

        if count == 0 {
            return 1.0;
        }
        let avg = sum / count as f64;
        if avg > DAMPING_HIGH {
            0.9
        } else if avg < DAMPING_LOW {
            1.1
        } else {
            1.0
        }
    }

    fn record_factor(&self, now_ms: u64, factor: f64) {
        let mut history = self.history.lock();
        history.push_back((now_ms, factor));
        while history.len() > MAX_HISTORY_ENTRIES {
            history.pop_front();
        }
    }

    fn purge_history(&self, now_ms: u64) {
        let mut history = self.history.lock();
        let cutoff = now_ms.saturating_sub(HISTORY_RETENTION_MS);
        while history.front().is_some_and(|&(ts, _)| ts < cutoff) {
            history.pop_front();
        }
    }
}

impl std::fmt::Debug for AdaptiveTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveTuner")
            .field("enabled", &self.is_enabled())
            .field("load_factor", &self.load_factor())
            .field("cycle_ms", &self.config.tuner_cycle_ms)
            .finish()
    }
}

/// Handle to the running tuner thread.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) leaves
/// the thread running detached; it exits on its own once the stop channel
/// disconnects.
#[derive(Debug)]
pub struct TunerHandle {
    handle: Option<thread::JoinHandle<()>>,
    stop_tx: mpsc::Sender<()>,
}

impl TunerHandle {
    /// Stops the tuner thread and waits for its in-flight cycle.
    pub fn shutdown(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("tuner thread panicked during shutdown");
            }
        }
    }
}
