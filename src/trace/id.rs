//! Identifier and time primitives for spans and traces

use std::fmt;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;

/// A 128-bit trace identifier split into its two 64-bit halves.
///
/// The lower half is always random and non-zero. When 128-bit generation
/// is enabled, the upper half encodes the trace start time: the top 32
/// bits hold unix seconds and the bottom 32 bits are zero. With 128-bit
/// generation disabled the upper half is zero and the id behaves as a
/// plain 64-bit id on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId {
    pub upper: u64,
    pub lower: u64,
}

impl TraceId {
    pub fn new(upper: u64, lower: u64) -> TraceId {
        TraceId { upper, lower }
    }

    /// Generate a fresh trace id. The lower half reuses the root span id,
    /// `start_ns` seeds the upper half in 128-bit mode.
    pub fn generate(lower: u64, start_ns: i64, wide: bool) -> TraceId {
        let upper = if wide {
            ((start_ns / 1_000_000_000) as u64) << 32
        } else {
            0
        };
        TraceId { upper, lower }
    }

    pub fn is_zero(&self) -> bool {
        self.upper == 0 && self.lower == 0
    }

    /// The full id as 32 lowercase hex characters.
    pub fn to_hex32(&self) -> String {
        format!("{:016x}{:016x}", self.upper, self.lower)
    }

    /// The upper half as 16 lowercase hex characters, as carried in the
    /// `_dd.p.tid` propagating tag.
    pub fn upper_hex16(&self) -> String {
        format!("{:016x}", self.upper)
    }

    /// Parse 32 hex characters into a full 128-bit id.
    pub fn from_hex32(s: &str) -> Option<TraceId> {
        if s.len() != 32 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let upper = u64::from_str_radix(&s[..16], 16).ok()?;
        let lower = u64::from_str_radix(&s[16..], 16).ok()?;
        Some(TraceId { upper, lower })
    }

    pub fn to_u128(&self) -> u128 {
        ((self.upper as u128) << 64) | self.lower as u128
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.upper == 0 {
            write!(f, "{}", self.lower)
        } else {
            write!(f, "{}", self.to_hex32())
        }
    }
}

/// Generate a random non-zero 64-bit span id.
pub fn random_span_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// Wall-clock nanoseconds since the unix epoch.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos()
}

/// A wall-clock anchor paired with a monotonic reference.
///
/// Span durations are measured against the monotonic clock so that
/// wall-clock adjustments during a span's lifetime cannot produce
/// negative or skewed durations.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicAnchor {
    wall_ns: i64,
    reference: Instant,
}

impl MonotonicAnchor {
    pub fn now() -> MonotonicAnchor {
        MonotonicAnchor {
            wall_ns: now_nanos(),
            reference: Instant::now(),
        }
    }

    /// Anchor at a caller-supplied start time; elapsed time still runs
    /// from the moment of this call.
    pub fn with_start(wall_ns: i64) -> MonotonicAnchor {
        MonotonicAnchor {
            wall_ns,
            reference: Instant::now(),
        }
    }

    pub fn start_nanos(&self) -> i64 {
        self.wall_ns
    }

    /// Wall time of the anchor plus monotonic elapsed time.
    pub fn now_nanos(&self) -> i64 {
        self.wall_ns + self.reference.elapsed().as_nanos() as i64
    }
}

/// Validate a 16-character lowercase hex string, as used for reparent
/// ids and the `_dd.p.tid` tag value.
pub fn is_hex16(s: &str) -> bool {
    s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a 16-hex-character value into a u64, tolerating uppercase.
pub fn parse_hex64(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_id_nonzero() {
        for _ in 0..64 {
            assert_ne!(random_span_id(), 0);
        }
    }

    #[test]
    fn test_trace_id_wide_layout() {
        let start = 1_700_000_123_456_789_000i64;
        let id = TraceId::generate(42, start, true);
        assert_eq!(id.upper >> 32, 1_700_000_123);
        assert_eq!(id.upper & 0xFFFF_FFFF, 0);
        assert_eq!(id.lower, 42);
    }

    #[test]
    fn test_trace_id_narrow_layout() {
        let id = TraceId::generate(42, now_nanos(), false);
        assert_eq!(id.upper, 0);
        assert_eq!(id.lower, 42);
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_hex_round_trip() {
        let id = TraceId::new(0x1234_5678_0000_0000, 0xdead_beef_cafe_f00d);
        let hex = id.to_hex32();
        assert_eq!(hex.len(), 32);
        assert_eq!(TraceId::from_hex32(&hex), Some(id));
    }

    #[test]
    fn test_hex32_rejects_bad_input() {
        assert!(TraceId::from_hex32("12345").is_none());
        assert!(TraceId::from_hex32("zz345678901234567890123456789012").is_none());
    }

    #[test]
    fn test_monotonic_anchor_moves_forward() {
        let anchor = MonotonicAnchor::now();
        let a = anchor.now_nanos();
        let b = anchor.now_nanos();
        assert!(b >= a);
        assert!(a >= anchor.start_nanos());
    }
}
