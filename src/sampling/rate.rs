//! Probability sampling and the spans-per-second token bucket

use std::time::Instant;

use parking_lot::Mutex;

/// Multiplier from Knuth's multiplicative hashing scheme. Deciding
/// keep/drop from the trace id this way makes every tracer in a
/// distributed system reach the same verdict for the same trace.
const KNUTH_FACTOR: u64 = 1_111_111_111_111_111_111;

/// Keep/drop decision for a trace id at the given rate.
pub fn sample_by_rate(trace_id_lower: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    trace_id_lower.wrapping_mul(KNUTH_FACTOR) < (rate * u64::MAX as f64) as u64
}

/// Head sampler applying one global probability to every new trace.
#[derive(Debug, Clone, Copy)]
pub struct RateSampler {
    rate: f64,
}

impl RateSampler {
    /// Rates outside [0, 1] are clamped.
    pub fn new(rate: f64) -> RateSampler {
        RateSampler {
            rate: rate.max(0.0).min(1.0),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn sample(&self, trace_id_lower: u64) -> bool {
        sample_by_rate(trace_id_lower, self.rate)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    window_start: Instant,
    allowed: u64,
    seen: u64,
    previous_rate: f64,
    has_previous: bool,
}

/// Token bucket limiting rule-kept spans per second.
///
/// Alongside the allow/deny verdict the limiter reports an effective
/// rate, the observed share of allowed requests, which callers stamp on
/// kept spans so the backend can correct counts upstream.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(per_second: f64) -> RateLimiter {
        let now = Instant::now();
        RateLimiter {
            capacity: per_second.max(1.0),
            per_second,
            state: Mutex::new(BucketState {
                tokens: per_second.max(1.0),
                last_refill: now,
                window_start: now,
                allowed: 0,
                seen: 0,
                previous_rate: 0.0,
                has_previous: false,
            }),
        }
    }

    /// Unlimited limiter, every request allowed at effective rate 1.
    pub fn unlimited() -> RateLimiter {
        RateLimiter::new(f64::INFINITY)
    }

    /// Consume one token. Returns the verdict and the effective rate.
    pub fn allow_one(&self) -> (bool, f64) {
        if self.per_second.is_infinite() {
            return (true, 1.0);
        }
        let mut state = self.state.lock();
        let now = Instant::now();

        // Close the 1s accounting window before deciding.
        if now.duration_since(state.window_start).as_secs_f64() >= 1.0 {
            state.previous_rate = if state.seen > 0 {
                state.allowed as f64 / state.seen as f64
            } else {
                1.0
            };
            state.has_previous = true;
            state.allowed = 0;
            state.seen = 0;
            state.window_start = now;
        }

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
        state.last_refill = now;

        state.seen += 1;
        let allowed = if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.allowed += 1;
            true
        } else {
            false
        };

        let current = state.allowed as f64 / state.seen as f64;
        let effective = if state.has_previous {
            (state.previous_rate + current) / 2.0
        } else {
            current
        };
        (allowed, effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_bounds() {
        assert!(sample_by_rate(12345, 1.0));
        assert!(!sample_by_rate(12345, 0.0));
        let s = RateSampler::new(7.5);
        assert_eq!(s.rate(), 1.0);
    }

    #[test]
    fn test_rate_is_deterministic_per_trace() {
        for id in [1u64, 999, u64::MAX / 3, u64::MAX] {
            let first = sample_by_rate(id, 0.5);
            for _ in 0..10 {
                assert_eq!(sample_by_rate(id, 0.5), first);
            }
        }
    }

    #[test]
    fn test_rate_roughly_respected() {
        let mut kept = 0usize;
        let total = 10_000u64;
        for id in 1..=total {
            // Spread ids across the u64 space.
            let spread = id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            if sample_by_rate(spread, 0.2) {
                kept += 1;
            }
        }
        let ratio = kept as f64 / total as f64;
        assert!(ratio > 0.15 && ratio < 0.25, "ratio {}", ratio);
    }

    #[test]
    fn test_limiter_exhausts_burst() {
        let limiter = RateLimiter::new(5.0);
        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.allow_one().0 {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_limiter_effective_rate_declines() {
        let limiter = RateLimiter::new(2.0);
        let mut last = 1.0;
        for _ in 0..8 {
            last = limiter.allow_one().1;
        }
        assert!(last < 1.0);
        assert!(last >= 0.25);
    }

    #[test]
    fn test_unlimited() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..100 {
            assert_eq!(limiter.allow_one(), (true, 1.0));
        }
    }
}
