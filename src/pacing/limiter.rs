//! Per-destination admission control.
//!
//! [`GroupLimiter`] owns the map of destination keys to token buckets,
//! creates buckets lazily on first use, reports every admission decision to
//! the [`MetricsCollector`], and evicts state for destinations that have
//! gone quiet.
//!
//! ```text
//!     Admission flow:
//!
//!     chat-17 ──┐
//!     chat-42 ──┼──► GroupLimiter ──► per-key GroupBucket
//!     news-1  ──┘         │
//!                         ▼
//!                ┌──────────────┐
//!                │  DashMap     │
//!                │  ┌─────────┐ │
//!                │  │key → 🪣 │ │
//!                │  │key → 🪣 │ │
//!                │  └─────────┘ │
//!                └──────────────┘
//! ```
//!
//! A refused admission is a normal outcome ("not yet"), never an error.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use super::bucket::{BucketSnapshot, BurstLevel, GroupBucket};
use super::config::PacerConfig;
use super::metrics::MetricsCollector;
use super::utils::current_time_ms;

/// Opaque identity of a pacing destination (a channel, group or chat).
///
/// Cheap to clone and hash; construct one from any string or numeric id:
///
/// ```rust
/// use pacer::GroupKey;
///
/// let by_name = GroupKey::from("announcements");
/// let by_id = GroupKey::from(-1001234567890_i64);
/// assert_ne!(by_name, by_id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey(Arc<str>);

impl GroupKey {
    /// The key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupKey {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for GroupKey {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl From<i64> for GroupKey {
    fn from(id: i64) -> Self {
        Self(Arc::from(id.to_string().as_str()))
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-destination token-bucket admission control.
///
/// Buckets are created on first use and shared behind `Arc`, so the tuner
/// can adjust a bucket while callers race fresh admissions on it —
/// last-writer-wins is fine for advisory pacing.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use pacer::{GroupKey, GroupLimiter, MetricsCollector, PacerConfig};
///
/// let metrics = Arc::new(MetricsCollector::new());
/// let limiter = GroupLimiter::new(PacerConfig::default(), metrics);
///
/// let key = GroupKey::from("chat-1");
/// if limiter.try_acquire(&key) {
///     // deliver the message
/// } else {
///     let _wait = limiter.wait_time(&key);
///     // defer and retry after the reported wait
/// }
/// ```
pub struct GroupLimiter {
    /// Destination key to bucket, sharded for concurrent access.
    buckets: DashMap<GroupKey, Arc<GroupBucket>, ahash::RandomState>,
    config: PacerConfig,
    metrics: Arc<MetricsCollector>,
}

impl GroupLimiter {
    /// Creates a limiter that reports admissions to `metrics`.
    pub fn new(config: PacerConfig, metrics: Arc<MetricsCollector>) -> Self {
        // Shard count scaled to the machine: fewer shards waste less memory,
        // more shards reduce contention.
        let num_shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .min(64)
            // dashmap requires a power-of-two shard count greater than 1;
            // clamp up so single-core machines don't produce an illegal 1.
            .max(2);

        Self {
            buckets: DashMap::with_capacity_and_hasher_and_shard_amount(
                128,
                ahash::RandomState::new(),
                num_shards,
            ),
            config,
            metrics,
        }
    }

    /// Asks "may I send to `key` now?".
    ///
    /// Non-blocking. Records the attempt in the burst-detection window,
    /// refills owed tokens and consumes one if available. The decision
    /// (with the residual wait on refusal) is reported to the collector.
    pub fn try_acquire(&self, key: &GroupKey) -> bool {
        let now = current_time_ms();
        let bucket = self.get_or_create(key, now);
        let outcome = bucket.try_acquire(now);

        if let Some((from, to)) = outcome.transition {
            self.note_transition(key, from, to);
        }
        self.metrics
            .record_admission(key, outcome.admitted, outcome.wait_hint_ms, now);

        outcome.admitted
    }

    /// Time until a token is expected for `key`.
    ///
    /// Zero when a token is available now — including for keys that have
    /// never been seen, whose first bucket starts full.
    pub fn wait_time(&self, key: &GroupKey) -> Duration {
        let now = current_time_ms();
        let wait_ms = self
            .buckets
            .get(key)
            .map_or(0, |bucket| bucket.wait_time_ms(now));
        Duration::from_millis(wait_ms)
    }

    /// Live bucket state for `key`, if one exists.
    ///
    /// Runs the de-escalation check first so a long-quiet group is not
    /// reported at a stale burst level.
    pub fn bucket_snapshot(&self, key: &GroupKey) -> Option<BucketSnapshot> {
        let now = current_time_ms();
        let bucket = self.buckets.get(key)?.clone();
        if let Some((from, to)) = bucket.maintain(now) {
            self.note_transition(key, from, to);
        }
        Some(bucket.snapshot(now))
    }

    /// Drops all state for one destination.
    ///
    /// The next admission recreates a fresh baseline bucket.
    pub fn reset_group(&self, key: &GroupKey) {
        if self.buckets.remove(key).is_some() {
            debug!(%key, "reset group bucket");
        }
        self.metrics.remove_group(key);
    }

    /// Drops all per-destination state.
    pub fn clear_all(&self) {
        let count = self.buckets.len();
        self.buckets.clear();
        for key in self.metrics.group_keys() {
            self.metrics.remove_group(&key);
        }
        info!(count, "cleared all group buckets");
    }

    /// Number of destinations currently tracked.
    #[inline]
    pub fn active_groups(&self) -> usize {
        self.buckets.len()
    }

    /// Evicts destinations idle past the configured TTL.
    ///
    /// Returns the number of buckets removed. Bucket and metrics maps are
    /// swept together so they cannot drift apart.
    pub fn sweep_idle(&self) -> usize {
        let now = current_time_ms();
        let ttl = self.config.inactivity_ttl_ms;
        let before = self.buckets.len();
        self.buckets.retain(|key, bucket| {
            if bucket.is_idle(ttl, now) {
                debug!(%key, "evicting idle group bucket");
                false
            } else {
                true
            }
        });
        let removed = before - self.buckets.len();
        let metrics_removed = self.metrics.sweep_idle_groups(ttl, now);
        if removed > 0 || metrics_removed > 0 {
            debug!(removed, metrics_removed, "idle sweep finished");
        }
        removed
    }

    /// Snapshot of every live bucket, for the tuner's per-key pass.
    ///
    /// Collecting up front keeps the tuner from holding shard locks while
    /// it recomputes parameters.
    pub(crate) fn buckets_snapshot(&self) -> Vec<(GroupKey, Arc<GroupBucket>)> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Runs the de-escalation check on every bucket (tuner cycle hook).
    pub(crate) fn maintain_all(&self) {
        let now = current_time_ms();
        for entry in self.buckets.iter() {
            if let Some((from, to)) = entry.value().maintain(now) {
                self.note_transition(entry.key(), from, to);
            }
        }
    }

    fn get_or_create(&self, key: &GroupKey, now: u64) -> Arc<GroupBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }
        match self.buckets.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let bucket = Arc::new(GroupBucket::new(&self.config, now));
                vacant.insert(bucket.clone());
                debug!(%key, "created group bucket");
                bucket
            }
        }
    }

    fn note_transition(&self, key: &GroupKey, from: BurstLevel, to: BurstLevel) {
        if to > from {
            self.metrics.record_burst_escalation();
            debug!(%key, %from, %to, "burst escalated");
        } else {
            debug!(%key, %from, %to, "burst de-escalated");
        }
    }
}

impl std::fmt::Debug for GroupLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupLimiter")
            .field("active_groups", &self.active_groups())
            .field("inactivity_ttl_ms", &self.config.inactivity_ttl_ms)
            .finish()
    }
}
