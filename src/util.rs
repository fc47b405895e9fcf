//! Internal utilities shared across the tracer runtime

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};

/// A single-shot stop latch shared by all background workers.
///
/// `trigger` is idempotent; workers park on `wait_timeout` so a stop
/// interrupts their tick instead of waiting out the interval.
pub struct StopLatch {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StopLatch {
    pub fn new() -> StopLatch {
        StopLatch {
            stopped: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Park for up to `timeout`. Returns true when stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.lock.lock();
        if self.is_stopped() {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        self.is_stopped()
    }
}

impl Default for StopLatch {
    fn default() -> Self {
        StopLatch::new()
    }
}

/// A log gate that lets one message through per interval and counts the
/// rest. Hot paths (dropped chunks, full traces) report through one of
/// these so a misbehaving workload cannot flood the log output.
pub struct RateLimitedLog {
    interval_secs: i64,
    last_emit: AtomicI64,
    suppressed: AtomicU64,
}

impl RateLimitedLog {
    pub const fn new(interval_secs: i64) -> RateLimitedLog {
        RateLimitedLog {
            interval_secs,
            last_emit: AtomicI64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns the number of messages suppressed since the last emit if
    /// the caller may log now, or None when the message should be
    /// swallowed.
    pub fn check(&self) -> Option<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let last = self.last_emit.load(Ordering::Acquire);
        if now - last >= self.interval_secs {
            if self
                .last_emit
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(self.suppressed.swap(0, Ordering::AcqRel));
            }
        }
        self.suppressed.fetch_add(1, Ordering::AcqRel);
        None
    }
}

/// Emit a rate-limited warning through a static gate.
#[macro_export]
macro_rules! warn_limited {
    ($gate:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $gate.check() {
            if suppressed > 0 {
                log::warn!("{} ({} similar messages suppressed)", format!($($arg)*), suppressed);
            } else {
                log::warn!($($arg)*);
            }
        }
    };
}
