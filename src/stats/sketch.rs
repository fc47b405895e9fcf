//! DDSketch quantile summaries
//!
//! A logarithmically bucketed sketch with a fixed relative accuracy.
//! Merging is associative, which is what lets buckets combine across
//! flush windows and processes. The wire form is the DDSketch protobuf
//! the agent ingests.

use std::collections::HashMap;

use prost::Message;

/// Relative accuracy of the quantile approximation.
const RELATIVE_ACCURACY: f64 = 0.007751;

fn gamma() -> f64 {
    (1.0 + RELATIVE_ACCURACY) / (1.0 - RELATIVE_ACCURACY)
}

#[derive(Debug, Clone)]
pub struct DDSketch {
    gamma_ln: f64,
    bins: HashMap<i32, f64>,
    zero_count: f64,
    count: f64,
    sum: f64,
}

impl DDSketch {
    pub fn new() -> DDSketch {
        DDSketch {
            gamma_ln: gamma().ln(),
            bins: HashMap::new(),
            zero_count: 0.0,
            count: 0.0,
            sum: 0.0,
        }
    }

    pub fn single(value: f64) -> DDSketch {
        let mut sketch = DDSketch::new();
        sketch.add(value);
        sketch
    }

    fn index_of(&self, value: f64) -> i32 {
        (value.ln() / self.gamma_ln).ceil() as i32
    }

    fn value_of(&self, index: i32) -> f64 {
        let g = gamma();
        2.0 * g.powi(index) / (g + 1.0)
    }

    /// Add one observation. Non-positive values land in the zero bin.
    pub fn add(&mut self, value: f64) {
        self.count += 1.0;
        self.sum += value.max(0.0);
        if value <= 0.0 {
            self.zero_count += 1.0;
            return;
        }
        let idx = self.index_of(value);
        *self.bins.entry(idx).or_insert(0.0) += 1.0;
    }

    pub fn merge_with(&mut self, other: &DDSketch) {
        self.count += other.count;
        self.sum += other.sum;
        self.zero_count += other.zero_count;
        for (idx, c) in &other.bins {
            *self.bins.entry(*idx).or_insert(0.0) += c;
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Approximate value at quantile `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> f64 {
        if self.count == 0.0 {
            return 0.0;
        }
        let rank = q.max(0.0).min(1.0) * self.count;
        let mut seen = self.zero_count;
        if seen >= rank {
            return 0.0;
        }
        let mut indexes: Vec<i32> = self.bins.keys().copied().collect();
        indexes.sort_unstable();
        for idx in &indexes {
            seen += self.bins[idx];
            if seen >= rank {
                return self.value_of(*idx);
            }
        }
        indexes.last().map_or(0.0, |idx| self.value_of(*idx))
    }

    /// The agent-facing protobuf encoding.
    pub fn to_proto_bytes(&self) -> Vec<u8> {
        let pb = PbDdSketch {
            mapping: Some(PbIndexMapping {
                gamma: gamma(),
                index_offset: 0.0,
                interpolation: 0,
            }),
            positive_values: Some(PbStore {
                bin_counts: self.bins.clone(),
                contiguous_bin_counts: Vec::new(),
                contiguous_bin_index_offset: 0,
            }),
            negative_values: Some(PbStore::default()),
            zero_count: self.zero_count,
        };
        pb.encode_to_vec()
    }
}

impl Default for DDSketch {
    fn default() -> Self {
        DDSketch::new()
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct PbDdSketch {
    #[prost(message, optional, tag = "1")]
    pub mapping: Option<PbIndexMapping>,
    #[prost(message, optional, tag = "2")]
    pub positive_values: Option<PbStore>,
    #[prost(message, optional, tag = "3")]
    pub negative_values: Option<PbStore>,
    #[prost(double, tag = "4")]
    pub zero_count: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbIndexMapping {
    #[prost(double, tag = "1")]
    pub gamma: f64,
    #[prost(double, tag = "2")]
    pub index_offset: f64,
    #[prost(int32, tag = "3")]
    pub interpolation: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct PbStore {
    #[prost(map = "sint32, double", tag = "1")]
    pub bin_counts: HashMap<i32, f64>,
    #[prost(double, repeated, tag = "2")]
    pub contiguous_bin_counts: Vec<f64>,
    #[prost(sint32, tag = "3")]
    pub contiguous_bin_index_offset: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_accuracy() {
        let mut sketch = DDSketch::new();
        for v in 1..=10_000 {
            sketch.add(v as f64);
        }
        for &(q, expected) in &[(0.5, 5000.0), (0.95, 9500.0), (0.99, 9900.0)] {
            let got = sketch.quantile(q);
            let err = (got - expected).abs() / expected;
            assert!(err < 0.02, "q{} expected ~{} got {}", q, expected, got);
        }
    }

    #[test]
    fn test_merge_matches_combined_adds() {
        let mut left = DDSketch::new();
        let mut right = DDSketch::new();
        let mut all = DDSketch::new();
        for v in 1..=500 {
            left.add(v as f64);
            all.add(v as f64);
        }
        for v in 500..=1000 {
            right.add(v as f64);
            all.add(v as f64);
        }
        left.merge_with(&right);
        assert_eq!(left.count(), all.count());
        let q_merged = left.quantile(0.9);
        let q_all = all.quantile(0.9);
        assert!((q_merged - q_all).abs() / q_all < 1e-9);
    }

    #[test]
    fn test_zero_and_negative_values() {
        let mut sketch = DDSketch::new();
        sketch.add(0.0);
        sketch.add(-5.0);
        sketch.add(10.0);
        assert_eq!(sketch.count(), 3.0);
        assert_eq!(sketch.quantile(0.1), 0.0);
    }

    #[test]
    fn test_proto_round_trip() {
        let mut sketch = DDSketch::new();
        sketch.add(42.0);
        sketch.add(0.0);
        let bytes = sketch.to_proto_bytes();
        let decoded = PbDdSketch::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.zero_count, 1.0);
        let store = decoded.positive_values.unwrap();
        assert_eq!(store.bin_counts.values().sum::<f64>(), 1.0);
        assert!((decoded.mapping.unwrap().gamma - gamma()).abs() < 1e-12);
    }
}
