//! Contextual send pacing and retry backoff.
//!
//! Two independent timings live here:
//!
//! - **Send delay** — how long a dispatcher should pause between successive
//!   sends to one destination, scaled by message type and size, clamped to
//!   the configured window.
//! - **Retry delay** — smoothed exponential backoff for failed operations.
//!   The effective multiplier ramps up with the attempt count instead of
//!   jumping straight to the configured maximum, and a small random jitter
//!   decorrelates retry storms across callers.
//!
//! ```text
//!     retry_delay(n):
//!
//!     effective = min(multiplier, 1.5 + 0.2·n)
//!     delay     = base · effectiveⁿ · (1 + U(0, 0.1))
//!     result    = clamp(delay, base/2, max)
//! ```
//!
//! Every computed delay is reported to the [`MetricsCollector`] under its
//! category ("text", "media", or "retry:<reason>").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::config::DelayConfig;
use super::metrics::MetricsCollector;

/// Retry reason used when the caller does not provide one.
pub const DEFAULT_RETRY_REASON: &str = "generic";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Live view of the delay parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayParameters {
    /// Current base interval between text sends, in milliseconds.
    pub text_interval_ms: u64,
    /// Current base interval between media sends, in milliseconds.
    pub media_interval_ms: u64,
    /// Lower clamp for send delays, in milliseconds.
    pub min_interval_ms: u64,
    /// Upper clamp for send delays, in milliseconds.
    pub max_interval_ms: u64,
}

/// Computes pacing delays between sends and backoff delays for retries.
///
/// The text/media intervals are rewritten at runtime by the adaptive tuner
/// (scaled from their configured baselines by the global load factor), so
/// they are plain atomics rather than fields behind a lock.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use pacer::{DelayCalculator, DelayConfig, MetricsCollector};
///
/// let metrics = Arc::new(MetricsCollector::new());
/// let delays = DelayCalculator::new(&DelayConfig::default(), metrics);
///
/// // A short text message gets a shortened interval.
/// let delay = delays.send_delay(false, 10);
/// assert!(delay >= Duration::from_millis(500));
///
/// // Third retry of a failed call, base 500ms, cap 5s, multiplier 2.
/// let backoff = delays.retry_delay(3, Duration::from_millis(500), Duration::from_secs(5), 2.0);
/// assert!(backoff <= Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct DelayCalculator {
    text_interval_ms: AtomicU64,
    media_interval_ms: AtomicU64,
    min_interval_ms: AtomicU64,
    max_interval_ms: AtomicU64,

    base_text_ms: u64,
    base_media_ms: u64,

    metrics: Arc<MetricsCollector>,
}

impl DelayCalculator {
    /// Creates a calculator at its configured baselines.
    pub fn new(config: &DelayConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            text_interval_ms: AtomicU64::new(config.text_interval_ms),
            media_interval_ms: AtomicU64::new(config.media_interval_ms),
            min_interval_ms: AtomicU64::new(config.min_interval_ms),
            max_interval_ms: AtomicU64::new(config.max_interval_ms),
            base_text_ms: config.text_interval_ms,
            base_media_ms: config.media_interval_ms,
            metrics,
        }
    }

    /// Pacing delay before the next send to the same destination.
    ///
    /// `content_length` is bytes for media, characters for text. The
    /// result is always inside `[min_interval, max_interval]`.
    pub fn send_delay(&self, is_media: bool, content_length: usize) -> Duration {
        let (base_ms, category) = if is_media {
            (self.media_interval_ms.load(Ordering::Acquire), "media")
        } else {
            (self.text_interval_ms.load(Ordering::Acquire), "text")
        };

        let multiplier = if is_media {
            Self::media_multiplier(content_length as u64)
        } else {
            Self::text_multiplier(content_length)
        };

        let raw = (base_ms as f64 * multiplier).round() as u64;
        let delay_ms = self.clamp_send(raw);

        self.metrics.record_delay(category, delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Smoothed exponential backoff for a failed operation.
    ///
    /// Equivalent to [`retry_delay_tagged`](Self::retry_delay_tagged) with
    /// the [`DEFAULT_RETRY_REASON`].
    pub fn retry_delay(
        &self,
        retry_count: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Duration {
        self.retry_delay_tagged(
            DEFAULT_RETRY_REASON,
            retry_count,
            base_delay,
            max_delay,
            backoff_multiplier,
        )
    }

    /// Smoothed exponential backoff, attributed to `reason` in the metrics.
    ///
    /// The effective multiplier is `min(backoff_multiplier,
    /// 1.5 + 0.2 × retry_count)`, so early retries back off gently even
    /// when the configured multiplier is aggressive. The result carries
    /// up to +10% jitter and is clamped to `[base/2, max]`.
    pub fn retry_delay_tagged(
        &self,
        reason: &str,
        retry_count: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Duration {
        let base_ms = base_delay.as_millis() as f64;
        let max_ms = max_delay.as_millis() as f64;

        let effective = backoff_multiplier.min(1.5 + 0.2 * retry_count as f64);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        let raw = base_ms * effective.powi(retry_count as i32) * (1.0 + jitter);
        let delay_ms = raw.clamp(base_ms / 2.0, max_ms.max(base_ms / 2.0)).round() as u64;

        self.metrics
            .record_delay(&format!("retry:{reason}"), delay_ms);
        self.metrics.record_retry_attempt(reason, delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// Current delay parameters.
    pub fn parameters(&self) -> DelayParameters {
        DelayParameters {
            text_interval_ms: self.text_interval_ms.load(Ordering::Acquire),
            media_interval_ms: self.media_interval_ms.load(Ordering::Acquire),
            min_interval_ms: self.min_interval_ms.load(Ordering::Acquire),
            max_interval_ms: self.max_interval_ms.load(Ordering::Acquire),
        }
    }

    /// Rescales the text/media intervals from their baselines (tuner hook).
    pub(crate) fn scale_with_load(&self, load_factor: f64) {
        let text = self.clamp_send((self.base_text_ms as f64 * load_factor).round() as u64);
        let media = self.clamp_send((self.base_media_ms as f64 * load_factor).round() as u64);
        self.text_interval_ms.store(text, Ordering::Release);
        self.media_interval_ms.store(media, Ordering::Release);
    }

    #[inline]
    fn clamp_send(&self, delay_ms: u64) -> u64 {
        let min = self.min_interval_ms.load(Ordering::Acquire);
        let max = self.max_interval_ms.load(Ordering::Acquire);
        delay_ms.clamp(min.min(max), max.max(min))
    }

    /// Size tiers for media payloads, in bytes.
    #[inline]
    fn media_multiplier(bytes: u64) -> f64 {
        if bytes > 10 * BYTES_PER_MB {
            1.8
        } else if bytes > 5 * BYTES_PER_MB {
            1.5
        } else if bytes > BYTES_PER_MB {
            1.2
        } else {
            1.0
        }
    }

    /// Length tiers for text payloads, in characters.
    #[inline]
    fn text_multiplier(chars: usize) -> f64 {
        if chars > 1000 {
            1.4
        } else if chars > 500 {
            1.2
        } else if chars > 200 {
            1.1
        } else if chars < 20 {
            0.8
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> (DelayCalculator, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        (
            DelayCalculator::new(&DelayConfig::default(), metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn test_text_tiers() {
        let (delays, _) = calculator();

        // Base 1000ms: short text shrinks, long text grows.
        assert_eq!(delays.send_delay(false, 10), Duration::from_millis(800));
        assert_eq!(delays.send_delay(false, 100), Duration::from_millis(1_000));
        assert_eq!(delays.send_delay(false, 300), Duration::from_millis(1_100));
        assert_eq!(delays.send_delay(false, 700), Duration::from_millis(1_200));
        assert_eq!(delays.send_delay(false, 2_000), Duration::from_millis(1_400));
    }

    #[test]
    fn test_media_tiers() {
        let (delays, _) = calculator();
        let mb = BYTES_PER_MB as usize;

        // Base 3000ms, scaled by payload size.
        assert_eq!(delays.send_delay(true, 512 * 1024), Duration::from_millis(3_000));
        assert_eq!(delays.send_delay(true, 2 * mb), Duration::from_millis(3_600));
        assert_eq!(delays.send_delay(true, 6 * mb), Duration::from_millis(4_500));
        assert_eq!(delays.send_delay(true, 20 * mb), Duration::from_millis(5_400));
    }

    #[test]
    fn test_send_delay_always_clamped() {
        let config = DelayConfig {
            text_interval_ms: 100,
            media_interval_ms: 50_000,
            min_interval_ms: 500,
            max_interval_ms: 8_000,
        };
        let delays = DelayCalculator::new(&config, Arc::new(MetricsCollector::new()));

        for length in [0, 10, 100, 1_000, 10_000, 100_000_000] {
            for is_media in [false, true] {
                let delay = delays.send_delay(is_media, length);
                assert!(delay >= Duration::from_millis(500));
                assert!(delay <= Duration::from_millis(8_000));
            }
        }
    }

    #[test]
    fn test_retry_delay_reference_scenario() {
        let (delays, _) = calculator();

        // retry 3, base 500ms, max 5s, multiplier 2.0: the non-jittered
        // value is 500 × 2³ = 4000ms, jitter adds at most 10%.
        for _ in 0..50 {
            let delay = delays.retry_delay(
                3,
                Duration::from_millis(500),
                Duration::from_secs(5),
                2.0,
            );
            assert!(delay >= Duration::from_millis(4_000));
            assert!(delay <= Duration::from_millis(4_400));
        }
    }

    #[test]
    fn test_retry_delay_bounds() {
        let (delays, _) = calculator();

        for count in 0..12 {
            let delay = delays.retry_delay(
                count,
                Duration::from_millis(500),
                Duration::from_secs(5),
                2.0,
            );
            assert!(delay >= Duration::from_millis(250));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_retry_delay_grows_with_count() {
        let (delays, _) = calculator();
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(600);

        // Below the clamp point, the non-jittered floor of attempt n+1 must
        // clear the jittered ceiling of attempt n.
        let expected = |n: u32| {
            let eff = 3.0_f64.min(1.5 + 0.2 * n as f64);
            100.0 * eff.powi(n as i32)
        };
        for n in 0..5 {
            let current = delays.retry_delay(n, base, max, 3.0);
            assert!(current.as_millis() as f64 >= expected(n) - 1.0);
            assert!(current.as_millis() as f64 <= expected(n) * 1.1 + 1.0);
            assert!(expected(n + 1) > expected(n));
        }
    }

    #[test]
    fn test_delays_are_reported() {
        let (delays, metrics) = calculator();

        delays.send_delay(false, 100);
        delays.send_delay(true, 100);
        delays.retry_delay_tagged(
            "http",
            1,
            Duration::from_millis(200),
            Duration::from_secs(2),
            2.0,
        );

        assert!(metrics.percentiles("text").is_some());
        assert!(metrics.percentiles("media").is_some());
        assert!(metrics.percentiles("retry:http").is_some());
        let report = metrics.generate_report();
        assert!(report.contains("retries[http]: 1 attempts"));
    }

    #[test]
    fn test_scale_with_load() {
        let (delays, _) = calculator();

        delays.scale_with_load(2.0);
        let params = delays.parameters();
        assert_eq!(params.text_interval_ms, 2_000);
        assert_eq!(params.media_interval_ms, 6_000);

        // Scaling down restores from the baseline, not the scaled value.
        delays.scale_with_load(0.5);
        let params = delays.parameters();
        assert_eq!(params.text_interval_ms, 500);
        assert_eq!(params.media_interval_ms, 1_500);

        // The clamp window always wins.
        delays.scale_with_load(100.0);
        assert_eq!(delays.parameters().text_interval_ms, 10_000);
    }
}
