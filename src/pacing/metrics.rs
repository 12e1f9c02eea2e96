//! In-memory metrics collection for the pacing engine.
//!
//! Every component reports here: the limiter records each admission
//! decision (and the residual wait on refusals), the delay calculator
//! records every computed delay under its category, and external
//! collaborators feed queue depth, retry outcomes and actual sends. The
//! adaptive tuner closes the loop by reading the aggregates back.
//!
//! ```text
//!     Metrics Dashboard:
//!     ┌─────────────────────────────────────┐
//!     │  Requests: 12,408  (96.1% admitted) │
//!     │  Avg wait: 34ms    Bursts: 7        │
//!     │  Queue: 3 (max 41) Overflows: 0     │
//!     │  Health: 93/100                     │
//!     └─────────────────────────────────────┘
//! ```
//!
//! All counters are atomics; per-category sample buffers sit behind
//! `try_lock` mutexes so recording never blocks a caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::limiter::GroupKey;

/// Upper bound on the rolling sample buffer kept per delay category.
const MAX_DELAY_SAMPLES: usize = 1000;

/// Retention of the per-group request-frequency window, in milliseconds.
const GROUP_WINDOW_MS: u64 = 60_000;

/// Average send delay at which the delay share of the health score
/// reaches zero, in milliseconds.
const HEALTH_DELAY_NORM_MS: f64 = 5_000.0;

/// Average queue wait at which the queue share of the health score
/// reaches zero, in milliseconds.
const HEALTH_QUEUE_NORM_MS: f64 = 2_000.0;

/// Overflow count at which the overflow share of the health score
/// reaches zero.
const HEALTH_OVERFLOW_NORM: f64 = 100.0;

/// Per-category delay statistics with a bounded percentile buffer.
#[derive(Debug)]
struct DelayStats {
    count: AtomicU64,
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

impl Default for DelayStats {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(128)),
        }
    }
}

impl DelayStats {
    fn record(&self, delay_ms: u64) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.sum_ms.fetch_add(delay_ms, Ordering::AcqRel);
        self.min_ms.fetch_min(delay_ms, Ordering::AcqRel);
        self.max_ms.fetch_max(delay_ms, Ordering::AcqRel);

        // Sample buffer is best-effort; a contended lock drops the sample,
        // not the counters.
        if let Some(mut samples) = self.samples.try_lock() {
            if samples.len() >= MAX_DELAY_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(delay_ms);
        }
    }

    /// Percentile over the rolling buffer; `None` when empty.
    fn percentile(&self, p: f64) -> Option<u64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        let idx = ((sorted.len() as f64 * p).ceil() as usize)
            .min(sorted.len())
            .saturating_sub(1);
        // O(n) partial sort — only positions the idx-th element correctly.
        sorted.select_nth_unstable(idx);
        Some(sorted[idx])
    }

    fn avg_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            0.0
        } else {
            self.sum_ms.load(Ordering::Acquire) as f64 / count as f64
        }
    }
}

/// Per-reason retry statistics.
#[derive(Debug, Default)]
struct RetryStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_delay_ms: AtomicU64,
}

/// Queue and throughput counters fed by external queueing collaborators.
#[derive(Debug, Default)]
struct QueueStats {
    depth: AtomicU64,
    max_depth: AtomicU64,
    cumulative_wait_ms: AtomicU64,
    throughput: AtomicU64,
    overflows: AtomicU64,
}

/// Rolling one-second send-rate window.
#[derive(Debug, Default)]
struct RateWindow {
    second: AtomicU64,
    count: AtomicU64,
    peak: AtomicU64,
}

impl RateWindow {
    fn record(&self, now_ms: u64) {
        let sec = now_ms / 1000;
        let current = self.second.load(Ordering::Acquire);
        if current == sec {
            let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
            self.peak.fetch_max(count, Ordering::AcqRel);
        } else if self
            .second
            .compare_exchange(current, sec, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.count.store(1, Ordering::Release);
            self.peak.fetch_max(1, Ordering::AcqRel);
        } else {
            // Lost the second rollover to another thread; count toward the
            // second it installed.
            self.count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn current(&self, now_ms: u64) -> u64 {
        if self.second.load(Ordering::Acquire) == now_ms / 1000 {
            self.count.load(Ordering::Acquire)
        } else {
            0
        }
    }
}

/// Per-group request bookkeeping with a 60-second frequency window.
#[derive(Debug)]
pub(crate) struct GroupMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    rejected_requests: AtomicU64,
    last_activity_ms: AtomicU64,
    window: Mutex<VecDeque<u64>>,
}

impl GroupMetrics {
    fn new(now_ms: u64) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(now_ms),
            window: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    fn record(&self, admitted: bool, now_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        if admitted {
            self.successful_requests.fetch_add(1, Ordering::AcqRel);
        } else {
            self.rejected_requests.fetch_add(1, Ordering::AcqRel);
        }
        self.last_activity_ms.store(now_ms, Ordering::Release);

        if let Some(mut window) = self.window.try_lock() {
            window.push_back(now_ms);
            let cutoff = now_ms.saturating_sub(GROUP_WINDOW_MS);
            while window.front().is_some_and(|&ts| ts < cutoff) {
                window.pop_front();
            }
        }
    }

    /// Requests per minute derived from the 60-second window.
    fn frequency_per_minute(&self, now_ms: u64) -> f64 {
        let mut window = self.window.lock();
        let cutoff = now_ms.saturating_sub(GROUP_WINDOW_MS);
        while window.front().is_some_and(|&ts| ts < cutoff) {
            window.pop_front();
        }
        window.len() as f64
    }

    fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Acquire);
        if total == 0 {
            1.0
        } else {
            self.successful_requests.load(Ordering::Acquire) as f64 / total as f64
        }
    }

    fn is_idle(&self, ttl_ms: u64, now_ms: u64) -> bool {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        now_ms.saturating_sub(last) > ttl_ms
    }
}

/// Point-in-time view of one group's metrics.
#[derive(Debug, Clone)]
pub struct GroupMetricsSnapshot {
    /// All admission attempts observed for the group.
    pub total_requests: u64,
    /// Attempts that were admitted.
    pub successful_requests: u64,
    /// Attempts that were refused.
    pub rejected_requests: u64,
    /// Requests per minute over the trailing 60 seconds.
    pub frequency_per_minute: f64,
    /// Fraction of attempts admitted, 1.0 when none were made.
    pub success_rate: f64,
    /// Milliseconds-since-epoch of the last attempt.
    pub last_activity_ms: u64,
}

/// Delay percentiles computed from the rolling sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPercentiles {
    /// Median delay in milliseconds.
    pub p50: u64,
    /// 90th percentile delay in milliseconds.
    pub p90: u64,
    /// 95th percentile delay in milliseconds.
    pub p95: u64,
    /// 99th percentile delay in milliseconds.
    pub p99: u64,
}

/// Aggregate engine statistics.
#[derive(Debug, Clone)]
pub struct PerformanceStats {
    /// All admission attempts across all groups.
    pub total_requests: u64,
    /// Admitted attempts.
    pub successful_requests: u64,
    /// Refused attempts.
    pub rejected_requests: u64,
    /// Fraction of attempts admitted.
    pub success_rate: f64,
    /// Mean residual wait across all admission attempts, in milliseconds.
    pub avg_wait_ms: f64,
    /// Number of burst escalations observed.
    pub burst_events: u64,
    /// Groups currently tracked.
    pub active_groups: usize,
    /// Current external queue depth.
    pub queue_depth: u64,
    /// Largest external queue depth observed.
    pub max_queue_depth: u64,
    /// Messages drained from the external queue.
    pub throughput: u64,
    /// Queue overflow events.
    pub overflows: u64,
    /// Composite health score, 0–100.
    pub health_score: u8,
}

/// Thread-safe, in-memory metrics sink and aggregator.
///
/// Constructed first and shared by reference with every other component
/// (the engine wires `MetricsCollector → limiter/delays → tuner`
/// explicitly; there is no global state).
///
/// # Example
///
/// ```rust
/// use pacer::MetricsCollector;
///
/// let metrics = MetricsCollector::new();
/// metrics.record_delay("text", 120);
/// metrics.record_delay("text", 80);
/// assert!(metrics.percentiles("text").is_some());
/// assert!(metrics.health_score() <= 100);
/// ```
#[derive(Debug)]
pub struct MetricsCollector {
    delays: DashMap<String, DelayStats, ahash::RandomState>,
    retries: DashMap<String, RetryStats, ahash::RandomState>,
    groups: DashMap<GroupKey, GroupMetrics, ahash::RandomState>,
    send_rates: DashMap<String, RateWindow, ahash::RandomState>,
    queue: QueueStats,

    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    rejected_requests: AtomicU64,
    admission_wait_sum_ms: AtomicU64,
    burst_events: AtomicU64,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self {
            delays: DashMap::with_hasher(ahash::RandomState::new()),
            retries: DashMap::with_hasher(ahash::RandomState::new()),
            groups: DashMap::with_hasher(ahash::RandomState::new()),
            send_rates: DashMap::with_hasher(ahash::RandomState::new()),
            queue: QueueStats::default(),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            admission_wait_sum_ms: AtomicU64::new(0),
            burst_events: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Recording (called by the limiter, delay calculator, collaborators)
    // ------------------------------------------------------------------

    /// Records one admission decision for `key`.
    ///
    /// `wait_ms` is the residual wait reported on refusal; admitted calls
    /// record zero wait.
    pub fn record_admission(&self, key: &GroupKey, admitted: bool, wait_ms: u64, now_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        if admitted {
            self.successful_requests.fetch_add(1, Ordering::AcqRel);
        } else {
            self.rejected_requests.fetch_add(1, Ordering::AcqRel);
        }
        self.admission_wait_sum_ms
            .fetch_add(wait_ms, Ordering::AcqRel);

        self.groups
            .entry(key.clone())
            .or_insert_with(|| GroupMetrics::new(now_ms))
            .record(admitted, now_ms);
    }

    /// Counts one burst escalation.
    pub fn record_burst_escalation(&self) {
        self.burst_events.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a computed delay under `category` ("text", "media",
    /// "retry:<reason>", ...).
    pub fn record_delay(&self, category: &str, delay_ms: u64) {
        self.delays
            .entry(category.to_owned())
            .or_default()
            .record(delay_ms);
    }

    /// Records a retry attempt and the backoff chosen for it.
    pub fn record_retry_attempt(&self, reason: &str, delay_ms: u64) {
        let stats = self.retries.entry(reason.to_owned()).or_default();
        stats.attempts.fetch_add(1, Ordering::AcqRel);
        stats.total_delay_ms.fetch_add(delay_ms, Ordering::AcqRel);
    }

    /// Records whether a retried operation eventually succeeded.
    pub fn record_retry_outcome(&self, reason: &str, success: bool) {
        let stats = self.retries.entry(reason.to_owned()).or_default();
        if success {
            stats.successes.fetch_add(1, Ordering::AcqRel);
        } else {
            stats.failures.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Records a message entering the external send queue.
    pub fn record_enqueue(&self) {
        let depth = self.queue.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.queue.max_depth.fetch_max(depth, Ordering::AcqRel);
    }

    /// Records a message leaving the external send queue after waiting
    /// `wait_ms`.
    pub fn record_dequeue(&self, wait_ms: u64) {
        let _ = self
            .queue
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(1))
            });
        self.queue
            .cumulative_wait_ms
            .fetch_add(wait_ms, Ordering::AcqRel);
        self.queue.throughput.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a send-queue overflow (message dropped or deferred).
    pub fn record_overflow(&self) {
        self.queue.overflows.fetch_add(1, Ordering::AcqRel);
    }

    /// Records one message actually sent, for send-rate tracking.
    pub fn record_send(&self, message_type: &str, now_ms: u64) {
        self.send_rates
            .entry(message_type.to_owned())
            .or_default()
            .record(now_ms);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Delay percentiles for `category`; `None` if nothing was recorded.
    pub fn percentiles(&self, category: &str) -> Option<DelayPercentiles> {
        let stats = self.delays.get(category)?;
        Some(DelayPercentiles {
            p50: stats.percentile(0.50)?,
            p90: stats.percentile(0.90)?,
            p95: stats.percentile(0.95)?,
            p99: stats.percentile(0.99)?,
        })
    }

    /// Current messages/second for `message_type`.
    pub fn current_send_rate(&self, message_type: &str, now_ms: u64) -> u64 {
        self.send_rates
            .get(message_type)
            .map_or(0, |w| w.current(now_ms))
    }

    /// Peak messages/second observed for `message_type`.
    pub fn peak_send_rate(&self, message_type: &str) -> u64 {
        self.send_rates
            .get(message_type)
            .map_or(0, |w| w.peak.load(Ordering::Acquire))
    }

    /// Mean residual wait across every admission attempt, in milliseconds.
    pub fn avg_admission_wait_ms(&self) -> f64 {
        let count = self.total_requests.load(Ordering::Acquire);
        if count == 0 {
            0.0
        } else {
            self.admission_wait_sum_ms.load(Ordering::Acquire) as f64 / count as f64
        }
    }

    /// Snapshot of one group's metrics.
    pub fn group_snapshot(&self, key: &GroupKey, now_ms: u64) -> Option<GroupMetricsSnapshot> {
        let group = self.groups.get(key)?;
        Some(GroupMetricsSnapshot {
            total_requests: group.total_requests.load(Ordering::Acquire),
            successful_requests: group.successful_requests.load(Ordering::Acquire),
            rejected_requests: group.rejected_requests.load(Ordering::Acquire),
            frequency_per_minute: group.frequency_per_minute(now_ms),
            success_rate: group.success_rate(),
            last_activity_ms: group.last_activity_ms.load(Ordering::Acquire),
        })
    }

    /// Number of groups currently tracked.
    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }

    /// Keys of all currently tracked groups.
    pub(crate) fn group_keys(&self) -> Vec<GroupKey> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    /// Composite health score in 0–100.
    ///
    /// Shares: send delay 30, retry success 30, queue wait 25, overflow 15.
    /// Each share degrades linearly toward zero as its signal approaches
    /// the corresponding norm.
    pub fn health_score(&self) -> u8 {
        let send_avg = {
            let (sum, count) = self
                .delays
                .iter()
                .filter(|e| !e.key().starts_with("retry"))
                .fold((0u64, 0u64), |(s, c), e| {
                    (
                        s + e.value().sum_ms.load(Ordering::Acquire),
                        c + e.value().count.load(Ordering::Acquire),
                    )
                });
            if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            }
        };
        let delay_share = 30.0 * (1.0 - (send_avg / HEALTH_DELAY_NORM_MS).min(1.0));

        let (retry_success, retry_resolved) = self.retries.iter().fold((0u64, 0u64), |(s, t), e| {
            let ok = e.value().successes.load(Ordering::Acquire);
            let failed = e.value().failures.load(Ordering::Acquire);
            (s + ok, t + ok + failed)
        });
        let retry_rate = if retry_resolved == 0 {
            1.0
        } else {
            retry_success as f64 / retry_resolved as f64
        };
        let retry_share = 30.0 * retry_rate;

        let throughput = self.queue.throughput.load(Ordering::Acquire);
        let queue_avg = if throughput == 0 {
            0.0
        } else {
            self.queue.cumulative_wait_ms.load(Ordering::Acquire) as f64 / throughput as f64
        };
        let queue_share = 25.0 * (1.0 - (queue_avg / HEALTH_QUEUE_NORM_MS).min(1.0));

        let overflows = self.queue.overflows.load(Ordering::Acquire) as f64;
        let overflow_share = 15.0 * (1.0 - (overflows / HEALTH_OVERFLOW_NORM).min(1.0));

        (delay_share + retry_share + queue_share + overflow_share).round() as u8
    }

    /// Aggregate statistics snapshot.
    pub fn performance_stats(&self) -> PerformanceStats {
        let total = self.total_requests.load(Ordering::Acquire);
        let successful = self.successful_requests.load(Ordering::Acquire);
        PerformanceStats {
            total_requests: total,
            successful_requests: successful,
            rejected_requests: self.rejected_requests.load(Ordering::Acquire),
            success_rate: if total == 0 {
                1.0
            } else {
                successful as f64 / total as f64
            },
            avg_wait_ms: self.avg_admission_wait_ms(),
            burst_events: self.burst_events.load(Ordering::Acquire),
            active_groups: self.active_groups(),
            queue_depth: self.queue.depth.load(Ordering::Acquire),
            max_queue_depth: self.queue.max_depth.load(Ordering::Acquire),
            throughput: self.queue.throughput.load(Ordering::Acquire),
            overflows: self.queue.overflows.load(Ordering::Acquire),
            health_score: self.health_score(),
        }
    }

    /// Human-readable report for operators.
    ///
    /// The exact layout is not a stable contract; it always contains the
    /// total request count, average wait, success rate, burst-event count
    /// and active-group count.
    pub fn generate_report(&self) -> String {
        let stats = self.performance_stats();
        let mut report = format!(
            "Pacing Engine Report:\n\
             ├─ Admission:\n\
             │  ├─ Total Requests: {}\n\
             │  ├─ Success Rate: {:.2}%\n\
             │  ├─ Average Wait: {:.1}ms\n\
             │  └─ Burst Events: {}\n\
             ├─ Queue:\n\
             │  ├─ Depth: {} (max {})\n\
             │  ├─ Throughput: {}\n\
             │  └─ Overflows: {}\n\
             ├─ Delays:\n",
            stats.total_requests,
            stats.success_rate * 100.0,
            stats.avg_wait_ms,
            stats.burst_events,
            stats.queue_depth,
            stats.max_queue_depth,
            stats.throughput,
            stats.overflows,
        );

        for entry in self.delays.iter() {
            let count = entry.value().count.load(Ordering::Acquire);
            let min = entry.value().min_ms.load(Ordering::Acquire);
            report.push_str(&format!(
                "│  ├─ {}: {} samples, avg {:.1}ms, min {}ms, max {}ms\n",
                entry.key(),
                count,
                entry.value().avg_ms(),
                if min == u64::MAX { 0 } else { min },
                entry.value().max_ms.load(Ordering::Acquire),
            ));
        }

        for entry in self.retries.iter() {
            report.push_str(&format!(
                "│  ├─ retries[{}]: {} attempts, {} ok, {} failed\n",
                entry.key(),
                entry.value().attempts.load(Ordering::Acquire),
                entry.value().successes.load(Ordering::Acquire),
                entry.value().failures.load(Ordering::Acquire),
            ));
        }

        report.push_str(&format!(
            "└─ Health:\n   ├─ Active Groups: {}\n   └─ Score: {}/100",
            stats.active_groups, stats.health_score
        ));
        report
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drops the per-group metrics for `key`.
    pub(crate) fn remove_group(&self, key: &GroupKey) {
        self.groups.remove(key);
    }

    /// Evicts groups idle past `ttl_ms`; returns how many were removed.
    pub(crate) fn sweep_idle_groups(&self, ttl_ms: u64, now_ms: u64) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| !group.is_idle(ttl_ms, now_ms));
        before - self.groups.len()
    }

    /// Clears every counter, sample buffer and per-group record.
    pub fn reset_all_metrics(&self) {
        self.delays.clear();
        self.retries.clear();
        self.groups.clear();
        self.send_rates.clear();
        self.queue.depth.store(0, Ordering::Release);
        self.queue.max_depth.store(0, Ordering::Release);
        self.queue.cumulative_wait_ms.store(0, Ordering::Release);
        self.queue.throughput.store(0, Ordering::Release);
        self.queue.overflows.store(0, Ordering::Release);
        self.total_requests.store(0, Ordering::Release);
        self.successful_requests.store(0, Ordering::Release);
        self.rejected_requests.store(0, Ordering::Release);
        self.admission_wait_sum_ms.store(0, Ordering::Release);
        self.burst_events.store(0, Ordering::Release);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
