//! Per-group token bucket with multi-level burst detection.
//!
//! Each destination (group, channel) owns one [`GroupBucket`]. Admission is
//! a lock-free token decrement; refill is claimed by a CAS on the refill
//! timestamp so that exactly one caller performs it and a losing caller
//! simply skips — the next call recovers anything missed.
//!
//! ## Burst levels
//!
//! ```text
//!     Window count vs. thresholds (defaults 30/50/80 per 6s):
//!
//!     None ──30──► Burst ──50──► Super ──80──► Extreme
//!       ▲            │             │              │
//!       │            └── count < threshold/3 ─────┘
//!       │                (one level at a time)
//!       └──────── burst older than 20s (direct reset)
//! ```
//!
//! Entering a level raises capacity (2.5×/3.5×/5×) and shortens the refill
//! interval (unchanged/halved/quartered); while elevated, refills are
//! additionally scaled (2×/2.5×/3×). Leaving the last level restores the
//! baseline exactly.
//!
//! ## Refill without drift
//!
//! The refill consumes only *whole* elapsed intervals and advances the
//! refill timestamp by exactly that much, preserving the remainder:
//!
//! ```text
//!     elapsed = 170ms, interval = 50ms
//!     periods = 3, timestamp += 150ms   (20ms remainder kept)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use super::config::{
    clamp_capacity, clamp_refill_interval, clamp_refill_tokens, BurstConfig, PacerConfig,
    MAX_REFILL_PERIODS,
};
use super::utils::{cpu_relax, CacheAligned};

/// Maximum number of CAS retry attempts for a token decrement.
///
/// Bounds spinning under extreme contention; an exhausted attempt is
/// reported as a refusal, which the caller already treats as "not yet".
const MAX_CAS_RETRIES: usize = 16;

/// Number of failed CAS attempts before exponential backoff starts.
const CAS_BACKOFF_THRESHOLD: usize = 4;

/// Minimum interval between last-activity timestamp updates (milliseconds).
///
/// The activity timestamp only feeds the idle sweep, so 100 ms granularity
/// is plenty and keeps one atomic store off the hot path.
const LAST_ACTIVITY_UPDATE_INTERVAL_MS: u64 = 100;

/// Discrete burst escalation state of a group.
///
/// Levels are strictly ordered; a group moves at most one level per
/// evaluation, except for the hard reset to [`BurstLevel::None`] when a
/// burst exceeds its maximum duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BurstLevel {
    /// Baseline traffic, no escalation.
    None = 0,
    /// First escalation tier.
    Burst = 1,
    /// Second escalation tier.
    Super = 2,
    /// Highest escalation tier.
    Extreme = 3,
}

impl BurstLevel {
    #[inline]
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Burst,
            2 => Self::Super,
            3 => Self::Extreme,
            _ => Self::None,
        }
    }

    /// Whether the group is in any burst tier.
    #[inline]
    pub fn is_elevated(self) -> bool {
        self != Self::None
    }

    /// Capacity multiplier applied to the baseline while at this level.
    #[inline]
    pub(crate) fn capacity_multiplier(self) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Burst => 2.5,
            Self::Super => 3.5,
            Self::Extreme => 5.0,
        }
    }

    /// Refill scaling applied while at this level.
    #[inline]
    pub(crate) fn refill_multiplier(self) -> f64 {
        match self {
            Self::None => 1.0,
            Self::Burst => 2.0,
            Self::Super => 2.5,
            Self::Extreme => 3.0,
        }
    }

    /// Divisor applied to the baseline refill interval at this level.
    #[inline]
    pub(crate) fn interval_divisor(self) -> u64 {
        match self {
            Self::None | Self::Burst => 1,
            Self::Super => 2,
            Self::Extreme => 4,
        }
    }

    #[inline]
    fn step_up(self) -> Self {
        match self {
            Self::None => Self::Burst,
            Self::Burst => Self::Super,
            Self::Super | Self::Extreme => Self::Extreme,
        }
    }

    #[inline]
    fn step_down(self) -> Self {
        match self {
            Self::None | Self::Burst => Self::None,
            Self::Super => Self::Burst,
            Self::Extreme => Self::Super,
        }
    }
}

impl std::fmt::Display for BurstLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Burst => write!(f, "burst"),
            Self::Super => write!(f, "super"),
            Self::Extreme => write!(f, "extreme"),
        }
    }
}

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcquireOutcome {
    /// Whether a token was consumed.
    pub admitted: bool,
    /// Residual wait until the next refill tick; zero when admitted.
    pub wait_hint_ms: u64,
    /// Burst transition performed during this call, if any.
    pub transition: Option<(BurstLevel, BurstLevel)>,
}

/// Read-only view of a bucket's live state.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    /// Current token capacity.
    pub capacity: u64,
    /// Tokens currently available.
    pub tokens: u64,
    /// Current refill interval in milliseconds.
    pub refill_interval_ms: u64,
    /// Tokens added per refill interval.
    pub refill_tokens: u64,
    /// Current burst level.
    pub burst_level: BurstLevel,
    /// Milliseconds-since-epoch of the last observed request.
    pub last_activity_ms: u64,
}

/// Token bucket state for a single destination.
///
/// All numeric state is atomic; the request-timestamp window sits behind a
/// `try_lock` mutex so a contended update is dropped instead of blocking
/// the caller. Refill-then-consume ordering is preserved on every call.
pub(crate) struct GroupBucket {
    // Hot path fields, cache-aligned to avoid false sharing.
    tokens: CacheAligned<AtomicU64>,
    last_refill_ms: CacheAligned<AtomicU64>,
    last_activity_ms: CacheAligned<AtomicU64>,

    // Live parameters, rewritten by burst transitions and the tuner.
    capacity: AtomicU64,
    refill_interval_ms: AtomicU64,
    refill_tokens: AtomicU64,

    // Burst state.
    burst_level: AtomicU8,
    burst_since_ms: AtomicU64,

    /// Request timestamps inside the burst detection window.
    window: Mutex<VecDeque<u64>>,

    // Baselines the tuner and burst machine derive live values from.
    base_capacity: u64,
    base_refill_interval_ms: u64,
    base_refill_tokens: u64,
    burst_cfg: BurstConfig,
}

impl GroupBucket {
    /// Creates a bucket at its configured baseline, full of tokens.
    pub(crate) fn new(config: &PacerConfig, now_ms: u64) -> Self {
        let capacity = clamp_capacity(config.base_capacity);
        let interval = clamp_refill_interval(config.base_refill_interval_ms);
        let refill = clamp_refill_tokens(config.base_refill_tokens);

        Self {
            tokens: CacheAligned::new(AtomicU64::new(capacity)),
            last_refill_ms: CacheAligned::new(AtomicU64::new(now_ms)),
            last_activity_ms: CacheAligned::new(AtomicU64::new(now_ms)),
            capacity: AtomicU64::new(capacity),
            refill_interval_ms: AtomicU64::new(interval),
            refill_tokens: AtomicU64::new(refill),
            burst_level: AtomicU8::new(BurstLevel::None as u8),
            burst_since_ms: AtomicU64::new(0),
            window: Mutex::new(VecDeque::with_capacity(64)),
            base_capacity: capacity,
            base_refill_interval_ms: interval,
            base_refill_tokens: refill,
            burst_cfg: config.burst.clone(),
        }
    }

    /// Attempts to admit one request: records the call in the detection
    /// window, re-evaluates the burst level, refills owed tokens, then
    /// tries to consume a token.
    pub(crate) fn try_acquire(&self, now_ms: u64) -> AcquireOutcome {
        self.touch(now_ms);

        // Window update and burst evaluation are best-effort: a contended
        // try_lock skips both, and the next call recovers.
        let transition = match self.record_request(now_ms) {
            Some(count) => self.evaluate_burst(now_ms, count),
            None => None,
        };

        self.refill(now_ms);
        let admitted = self.try_consume();
        let wait_hint_ms = if admitted {
            0
        } else {
            self.time_to_next_refill(now_ms)
        };

        AcquireOutcome {
            admitted,
            wait_hint_ms,
            transition,
        }
    }

    /// Time until a token is expected, in milliseconds.
    ///
    /// Refills first; zero means a token is available right now.
    pub(crate) fn wait_time_ms(&self, now_ms: u64) -> u64 {
        self.refill(now_ms);
        if self.tokens.value.load(Ordering::Acquire) > 0 {
            0
        } else {
            self.time_to_next_refill(now_ms)
        }
    }

    /// De-escalation check without a new request.
    ///
    /// Called by the tuner each cycle (and before snapshots) so a group
    /// that went quiet does not stay elevated until its next request.
    pub(crate) fn maintain(&self, now_ms: u64) -> Option<(BurstLevel, BurstLevel)> {
        if !self.level().is_elevated() {
            return None;
        }
        let count = {
            let mut window = self.window.try_lock()?;
            Self::prune_window(&mut window, now_ms, self.burst_cfg.window_ms);
            window.len() as u32
        };
        self.evaluate_burst(now_ms, count)
    }

    /// Current burst level.
    #[inline]
    pub(crate) fn level(&self) -> BurstLevel {
        BurstLevel::from_u8(self.burst_level.load(Ordering::Acquire))
    }

    /// Whether the bucket has seen no request for `ttl_ms`.
    #[inline]
    pub(crate) fn is_idle(&self, ttl_ms: u64, now_ms: u64) -> bool {
        let last = self.last_activity_ms.value.load(Ordering::Acquire);
        now_ms.saturating_sub(last) > ttl_ms
    }

    /// Rewrites the live parameters (tuner entry point).
    ///
    /// Values are clamped to their legal ranges; the token count is shrunk
    /// if it exceeds the new capacity.
    pub(crate) fn apply_tuning(&self, capacity: u64, interval_ms: u64, refill_tokens: u64) {
        let capacity = clamp_capacity(capacity);
        self.capacity.store(capacity, Ordering::Release);
        self.refill_interval_ms
            .store(clamp_refill_interval(interval_ms), Ordering::Release);
        self.refill_tokens
            .store(clamp_refill_tokens(refill_tokens), Ordering::Release);
        self.shrink_tokens_to(capacity);
    }

    /// Baseline (capacity, interval, refill) this bucket was created with.
    #[inline]
    pub(crate) fn baseline(&self) -> (u64, u64, u64) {
        (
            self.base_capacity,
            self.base_refill_interval_ms,
            self.base_refill_tokens,
        )
    }

    /// Point-in-time view of the bucket, with a fresh refill applied.
    pub(crate) fn snapshot(&self, now_ms: u64) -> BucketSnapshot {
        self.refill(now_ms);
        BucketSnapshot {
            capacity: self.capacity.load(Ordering::Acquire),
            tokens: self.tokens.value.load(Ordering::Acquire),
            refill_interval_ms: self.refill_interval_ms.load(Ordering::Acquire),
            refill_tokens: self.refill_tokens.load(Ordering::Acquire),
            burst_level: self.level(),
            last_activity_ms: self.last_activity_ms.value.load(Ordering::Acquire),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Updates the last-activity timestamp, throttled to reduce contention.
    #[inline]
    fn touch(&self, now_ms: u64) {
        let last = self.last_activity_ms.value.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) > LAST_ACTIVITY_UPDATE_INTERVAL_MS {
            self.last_activity_ms.value.store(now_ms, Ordering::Relaxed);
        }
    }

    /// Records `now` into the detection window and returns the window
    /// count, or `None` when the window lock is contended.
    fn record_request(&self, now_ms: u64) -> Option<u32> {
        let mut window = self.window.try_lock()?;
        window.push_back(now_ms);
        Self::prune_window(&mut window, now_ms, self.burst_cfg.window_ms);
        Some(window.len() as u32)
    }

    fn prune_window(window: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while window.front().is_some_and(|&ts| ts < cutoff) {
            window.pop_front();
        }
    }

    /// Single-step burst transition based on the current window count.
    ///
    /// At most one level per evaluation, except the hard reset to `None`
    /// once the burst outlives its maximum duration. The winning thread is
    /// decided by a CAS on the level byte; the loser does nothing.
    fn evaluate_burst(&self, now_ms: u64, count: u32) -> Option<(BurstLevel, BurstLevel)> {
        let current = self.level();
        let thresholds = self.burst_cfg.thresholds;

        let next = if current != BurstLevel::Extreme && count >= thresholds[current as usize] {
            current.step_up()
        } else if current.is_elevated() {
            let since = self.burst_since_ms.load(Ordering::Acquire);
            if now_ms.saturating_sub(since) >= self.burst_cfg.max_duration_ms {
                BurstLevel::None
            } else if count < thresholds[current as usize - 1] / 3 {
                current.step_down()
            } else {
                current
            }
        } else {
            current
        };

        if next == current {
            return None;
        }

        if self
            .burst_level
            .compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Another thread transitioned first; its view wins.
            return None;
        }

        if !current.is_elevated() {
            // Entering the ladder: the duration clock starts here and keeps
            // running across further escalations.
            self.burst_since_ms.store(now_ms, Ordering::Release);
        }
        self.apply_burst_level(next);
        Some((current, next))
    }

    /// Applies the capacity/interval overrides for `level`.
    fn apply_burst_level(&self, level: BurstLevel) {
        let capacity =
            clamp_capacity((self.base_capacity as f64 * level.capacity_multiplier()).round() as u64);
        let interval =
            clamp_refill_interval(self.base_refill_interval_ms / level.interval_divisor());

        self.capacity.store(capacity, Ordering::Release);
        self.refill_interval_ms.store(interval, Ordering::Release);
        self.shrink_tokens_to(capacity);
        if level == BurstLevel::None {
            self.burst_since_ms.store(0, Ordering::Release);
        }
    }

    /// Refills tokens owed since the last refill.
    ///
    /// Consumes whole elapsed intervals only and advances the refill
    /// timestamp by exactly the consumed amount, so sub-interval remainders
    /// accumulate instead of being discarded. The CAS on the timestamp
    /// doubles as the claim: a losing thread skips the refill entirely.
    fn refill(&self, now_ms: u64) {
        let interval = self.refill_interval_ms.load(Ordering::Acquire).max(1);
        let last = self.last_refill_ms.value.load(Ordering::Acquire);
        let elapsed = now_ms.saturating_sub(last);
        if elapsed < interval {
            return;
        }

        let periods = (elapsed / interval).min(MAX_REFILL_PERIODS);
        let new_last = last + periods * interval;
        if self
            .last_refill_ms
            .value
            .compare_exchange(last, new_last, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread claimed this refill.
            return;
        }

        let per_interval = self.refill_tokens.load(Ordering::Acquire);
        let mut owed = periods.saturating_mul(per_interval);
        let level = self.level();
        if level.is_elevated() {
            owed = (owed as f64 * level.refill_multiplier()).round() as u64;
        }
        self.add_tokens(owed);
    }

    /// Adds tokens, capped at the current capacity.
    fn add_tokens(&self, n: u64) {
        if n == 0 {
            return;
        }
        let capacity = self.capacity.load(Ordering::Acquire);
        let mut retries = 0;
        let mut current = self.tokens.value.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(n).min(capacity);
            match self.tokens.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    current = actual;
                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        warn!("token refill CAS retry limit reached");
                        return;
                    }
                    Self::relax(retries);
                }
            }
        }
    }

    /// Attempts to consume one token with a bounded CAS loop.
    fn try_consume(&self) -> bool {
        let mut retries = 0;
        loop {
            let current = self.tokens.value.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            match self.tokens.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) if actual == 0 => return false,
                Err(_) => {
                    retries += 1;
                    if retries >= MAX_CAS_RETRIES {
                        warn!("token consume CAS retry limit reached");
                        return false;
                    }
                    Self::relax(retries);
                }
            }
        }
    }

    /// Caps the token count at `capacity` after a shrink.
    fn shrink_tokens_to(&self, capacity: u64) {
        let mut current = self.tokens.value.load(Ordering::Acquire);
        while current > capacity {
            match self.tokens.value.compare_exchange_weak(
                current,
                capacity,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    fn time_to_next_refill(&self, now_ms: u64) -> u64 {
        let interval = self.refill_interval_ms.load(Ordering::Acquire);
        let last = self.last_refill_ms.value.load(Ordering::Acquire);
        (last + interval).saturating_sub(now_ms)
    }

    #[inline]
    fn relax(retries: usize) {
        if retries > CAS_BACKOFF_THRESHOLD {
            for _ in 0..(1 << (retries - CAS_BACKOFF_THRESHOLD).min(4)) {
                cpu_relax();
            }
        } else {
            cpu_relax();
        }
    }
}

impl std::fmt::Debug for GroupBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupBucket")
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .field("tokens", &self.tokens.value.load(Ordering::Relaxed))
            .field(
                "refill_interval_ms",
                &self.refill_interval_ms.load(Ordering::Relaxed),
            )
            .field("burst_level", &self.level())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::utils::current_time_ms;

    fn bucket() -> GroupBucket {
        GroupBucket::new(&PacerConfig::default(), current_time_ms())
    }

    fn bucket_with(config: PacerConfig) -> GroupBucket {
        GroupBucket::new(&config, current_time_ms())
    }

    #[test]
    fn test_exact_capacity_admissions() {
        // 25 immediate calls against a 20-token bucket: exactly 20 admitted.
        let bucket = bucket();
        let now = current_time_ms();

        let admitted = (0..25)
            .filter(|_| bucket.try_acquire(now).admitted)
            .count();
        assert_eq!(admitted, 20);
        assert_eq!(bucket.level(), BurstLevel::None);
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let bucket = bucket();
        let now = current_time_ms();

        for i in 0..200 {
            bucket.try_acquire(now + i);
            let snapshot = bucket.snapshot(now + i);
            assert!(snapshot.tokens <= snapshot.capacity);
        }
    }

    #[test]
    fn test_refused_call_reports_wait_hint() {
        let bucket = bucket();
        let now = current_time_ms();

        for _ in 0..20 {
            assert!(bucket.try_acquire(now).admitted);
        }
        let outcome = bucket.try_acquire(now);
        assert!(!outcome.admitted);
        assert!(outcome.wait_hint_ms > 0);
        assert!(outcome.wait_hint_ms <= 50);
    }

    #[test]
    fn test_refill_after_interval() {
        let bucket = bucket();
        let now = current_time_ms();

        for _ in 0..20 {
            assert!(bucket.try_acquire(now).admitted);
        }
        let wait = bucket.wait_time_ms(now);
        assert!(wait > 0 && wait <= 50);

        // Two whole intervals later: 2 × 4 tokens owed.
        let later = now + 120;
        let snapshot = bucket.snapshot(later);
        assert_eq!(snapshot.tokens, 8);
    }

    #[test]
    fn test_refill_preserves_remainder() {
        let config = PacerConfig {
            base_refill_interval_ms: 100,
            ..Default::default()
        };
        let bucket = bucket_with(config);
        let now = current_time_ms();

        for _ in 0..20 {
            assert!(bucket.try_acquire(now).admitted);
        }

        // 150ms elapsed: one whole period consumed, 50ms remainder kept.
        assert_eq!(bucket.snapshot(now + 150).tokens, 4);
        // 60ms more: remainder + 60 = 110ms since the last consumed period.
        assert_eq!(bucket.snapshot(now + 210).tokens, 8);
    }

    #[test]
    fn test_refill_periods_are_capped() {
        let bucket = bucket();
        let now = current_time_ms();
        for _ in 0..20 {
            bucket.try_acquire(now);
        }

        // A week of idleness still refills at most MAX_REFILL_PERIODS worth,
        // and the cap keeps it at capacity.
        let snapshot = bucket.snapshot(now + 7 * 24 * 3600 * 1000);
        assert_eq!(snapshot.tokens, snapshot.capacity);
    }

    #[test]
    fn test_burst_escalation_to_extreme() {
        let bucket = bucket();
        let now = current_time_ms();

        // 81 calls inside the window walk the ladder one step per call.
        for i in 0..81 {
            bucket.try_acquire(now + i);
        }

        let snapshot = bucket.snapshot(now + 81);
        assert_eq!(snapshot.burst_level, BurstLevel::Extreme);
        assert_eq!(snapshot.capacity, 100); // 20 × 5.0
        assert!(snapshot.refill_interval_ms < 50);
    }

    #[test]
    fn test_burst_steps_one_level_at_a_time() {
        let bucket = bucket();
        let now = current_time_ms();

        for i in 0..30 {
            bucket.try_acquire(now + i);
        }
        assert_eq!(bucket.level(), BurstLevel::Burst);

        for i in 30..50 {
            bucket.try_acquire(now + i);
        }
        assert_eq!(bucket.level(), BurstLevel::Super);
    }

    #[test]
    fn test_burst_reset_after_max_duration() {
        let config = PacerConfig {
            burst: BurstConfig {
                window_ms: 6_000,
                thresholds: [5, 10, 15],
                max_duration_ms: 300,
            },
            ..Default::default()
        };
        let bucket = bucket_with(config);
        let now = current_time_ms();

        for i in 0..16 {
            bucket.try_acquire(now + i);
        }
        assert_eq!(bucket.level(), BurstLevel::Extreme);

        // Past the duration ceiling the level drops straight to None and the
        // baseline parameters come back.
        let transition = bucket.maintain(now + 400);
        assert_eq!(transition, Some((BurstLevel::Extreme, BurstLevel::None)));

        let snapshot = bucket.snapshot(now + 400);
        assert_eq!(snapshot.burst_level, BurstLevel::None);
        assert_eq!(snapshot.capacity, 20);
        assert_eq!(snapshot.refill_interval_ms, 50);
    }

    #[test]
    fn test_burst_deescalates_one_level_on_quiet_window() {
        let config = PacerConfig {
            burst: BurstConfig {
                window_ms: 200,
                thresholds: [5, 10, 15],
                max_duration_ms: 3_600_000,
            },
            ..Default::default()
        };
        let bucket = bucket_with(config);
        let now = current_time_ms();

        for i in 0..16 {
            bucket.try_acquire(now + i);
        }
        assert_eq!(bucket.level(), BurstLevel::Extreme);

        // Window empties; each maintenance pass steps down one level.
        let quiet = now + 500;
        assert_eq!(
            bucket.maintain(quiet),
            Some((BurstLevel::Extreme, BurstLevel::Super))
        );
        assert_eq!(
            bucket.maintain(quiet + 1),
            Some((BurstLevel::Super, BurstLevel::Burst))
        );
        assert_eq!(
            bucket.maintain(quiet + 2),
            Some((BurstLevel::Burst, BurstLevel::None))
        );
        assert_eq!(bucket.maintain(quiet + 3), None);
    }

    #[test]
    fn test_burst_refill_is_scaled() {
        let bucket = bucket();
        let now = current_time_ms();

        // 30 rapid calls: 20 admitted, the bucket empties, and the window
        // count reaches the Burst threshold (interval stays at 50ms there,
        // refills run at ×2).
        for _ in 0..30 {
            bucket.try_acquire(now);
        }
        assert_eq!(bucket.level(), BurstLevel::Burst);

        // One interval later: 4 × 2.0 = 8 tokens owed.
        let snapshot = bucket.snapshot(now + 70);
        assert_eq!(snapshot.tokens, 8);
    }

    #[test]
    fn test_apply_tuning_clamps_and_shrinks() {
        let bucket = bucket();
        let now = current_time_ms();

        bucket.apply_tuning(1_000, 1, 500);
        let snapshot = bucket.snapshot(now);
        assert_eq!(snapshot.capacity, 100);
        assert_eq!(snapshot.refill_interval_ms, 30);
        assert_eq!(snapshot.refill_tokens, 20);

        // Shrinking capacity below the current token count caps tokens.
        bucket.apply_tuning(5, 50, 4);
        let snapshot = bucket.snapshot(now);
        assert_eq!(snapshot.capacity, 5);
        assert!(snapshot.tokens <= 5);
    }

    #[test]
    fn test_idle_detection() {
        let bucket = bucket();
        let now = current_time_ms();
        bucket.try_acquire(now);

        assert!(!bucket.is_idle(1_000, now + 500));
        assert!(bucket.is_idle(1_000, now + 2_000));
    }

    #[test]
    fn test_concurrent_acquire_never_oversells() {
        use std::sync::Arc;
        use std::thread;

        let bucket = Arc::new(bucket());
        let now = current_time_ms();
        let mut handles = vec![];

        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(thread::spawn(move || {
                (0..10).filter(|_| bucket.try_acquire(now).admitted).count()
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 20 tokens, no time passes: at most 20 admissions.
        assert!(total <= 20);
        assert!(total >= 15);
    }

    #[test]
    fn test_burst_level_ordering() {
        assert!(BurstLevel::None < BurstLevel::Burst);
        assert!(BurstLevel::Burst < BurstLevel::Super);
        assert!(BurstLevel::Super < BurstLevel::Extreme);
        assert_eq!(BurstLevel::Extreme.step_up(), BurstLevel::Extreme);
        assert_eq!(BurstLevel::None.step_down(), BurstLevel::None);
        assert_eq!(format!("{}", BurstLevel::Super), "super");
    }
}
