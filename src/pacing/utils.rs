//! Platform helpers shared by the pacing engine: a monotonic millisecond
//! clock, CPU relaxation for CAS retry loops, and cache-line alignment to
//! keep hot atomics from false-sharing.
//!
//! ```text
//!     Platform-Specific Features:
//!
//!     x86_64 (Intel/AMD):
//!     ├─ Cache line: 64 bytes
//!     └─ PAUSE instruction for spin loops
//!
//!     AArch64 (ARM):
//!     ├─ Cache line: 128 bytes
//!     └─ YIELD instruction for spin loops
//!
//!     Generic (Fallback):
//!     ├─ Cache line: 64 bytes (assumed)
//!     └─ Standard spin loop hints
//! ```

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Cache line size for x86_64 processors (Intel/AMD).
#[cfg(target_arch = "x86_64")]
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Cache line size for ARM64 processors.
#[cfg(target_arch = "aarch64")]
pub(crate) const CACHE_LINE_SIZE: usize = 128;

/// Default cache line size for other architectures.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) const CACHE_LINE_SIZE: usize = 64;

// Monotonic time base to prevent issues when the system clock jumps.
// We capture the wall-clock epoch milliseconds at process start, then
// advance using a monotonic Instant to compute 'now'.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

/// CPU-specific relaxation hint for spin loops.
///
/// Tells the CPU we are in a retry loop so it can reduce power and give
/// resources to sibling threads.
///
/// - **x86_64**: PAUSE instruction
/// - **ARM64**: YIELD via the standard spin loop hint
/// - **Others**: standard spin loop hint
#[inline(always)]
pub fn cpu_relax() {
    #[cfg(target_arch = "x86_64")]
    {
        #[cfg(any(target_feature = "sse2", target_feature = "sse"))]
        unsafe {
            std::arch::x86_64::_mm_pause();
        }
        #[cfg(not(any(target_feature = "sse2", target_feature = "sse")))]
        {
            std::hint::spin_loop();
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::hint::spin_loop();
    }
}

/// Returns the current time in milliseconds since UNIX epoch.
///
/// The value is anchored to the wall clock once at startup and advanced
/// monotonically, so refill arithmetic never runs backwards when the
/// system clock is adjusted.
///
/// # Example
///
/// ```rust
/// use pacer::current_time_ms;
///
/// let now = current_time_ms();
/// assert!(now > 0);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    });
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Cache-aligned wrapper preventing false sharing between hot atomics.
///
/// Without alignment, two frequently-written atomics that land on the same
/// cache line invalidate each other's cache on every write even though the
/// writes are logically independent.
#[cfg(target_arch = "aarch64")]
#[repr(C, align(128))]
pub(crate) struct CacheAligned<T> {
    /// The wrapped value.
    pub value: T,
}

/// Cache-aligned wrapper preventing false sharing between hot atomics.
#[cfg(not(target_arch = "aarch64"))]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T> {
    /// The wrapped value.
    pub value: T,
}

impl<T> CacheAligned<T> {
    /// Creates a new cache-aligned value.
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Default> Default for CacheAligned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}
