//! Agent-feedback priority sampler
//!
//! The agent's trace endpoint answers every payload with a
//! `rate_by_service` map. Those rates steer the keep/drop decision for
//! traces that no rule matched. The whole map is swapped on update;
//! readers only take the shared lock.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::sampling::rate::sample_by_rate;

const DEFAULT_RATE_KEY: &str = "service:,env:";

pub struct PrioritySampler {
    rates: RwLock<HashMap<String, f64>>,
    default_rate: RwLock<f64>,
}

impl PrioritySampler {
    pub fn new() -> PrioritySampler {
        PrioritySampler {
            rates: RwLock::new(HashMap::new()),
            default_rate: RwLock::new(1.0),
        }
    }

    /// Install a fresh rate map from agent feedback. The reserved
    /// `service:,env:` entry, when present, becomes the fallback rate.
    pub fn update_rates(&self, mut rates: HashMap<String, f64>) {
        if let Some(rate) = rates.remove(DEFAULT_RATE_KEY) {
            *self.default_rate.write() = rate.max(0.0).min(1.0);
        }
        for rate in rates.values_mut() {
            *rate = rate.max(0.0).min(1.0);
        }
        *self.rates.write() = rates;
    }

    pub fn rate_for(&self, service: &str, env: &str) -> f64 {
        let key = format!("service:{},env:{}", service, env);
        if let Some(rate) = self.rates.read().get(&key) {
            return *rate;
        }
        *self.default_rate.read()
    }

    /// Keep/drop for the given trace id under the feedback rate.
    pub fn sample(&self, trace_id_lower: u64, service: &str, env: &str) -> (bool, f64) {
        let rate = self.rate_for(service, env);
        (sample_by_rate(trace_id_lower, rate), rate)
    }
}

impl Default for PrioritySampler {
    fn default() -> Self {
        PrioritySampler::new()
    }
}
