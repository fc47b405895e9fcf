//! Tracer configuration
//!
//! Configuration is resolved in three layers: compiled-in defaults,
//! `DD_*` environment variables, and programmatic `with_*` setters.
//! Later layers win. Malformed values never abort startup; they are
//! logged at WARN and the safe default is kept.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::propagation::PropagationStyle;
use crate::sampling::rules::SamplingRule;

/// Ceiling on spans retained for a single trace. Beyond it the trace is
/// dropped wholesale to bound memory for runaway workloads.
pub const TRACE_MAX_SIZE: usize = 100_000;

/// Default cap on the serialized `x-datadog-tags` header.
pub const DEFAULT_TAGS_HEADER_MAX_LEN: usize = 512;

const DEFAULT_AGENT_URL: &str = "http://localhost:8126";
const DEFAULT_PARTIAL_FLUSH_MIN_SPANS: usize = 1000;

/// Complete tracer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name stamped on every span.
    pub service: String,
    /// Deployment environment (`env` tag).
    pub env: Option<String>,
    /// Application version (`version` tag).
    pub version: Option<String>,
    /// Hostname reported in payloads.
    pub hostname: Option<String>,
    /// Trace-agent endpoint. A unix socket path may be given as
    /// `unix:///path/to/apm.socket`.
    pub agent_url: String,
    /// Agent unix socket path; preferred over `agent_url` when set.
    pub uds_path: Option<String>,
    /// Per-request HTTP timeout towards the agent.
    #[serde(skip)]
    pub agent_timeout: Duration,
    /// Global head sampling rate in [0, 1]. None means no rate sampler.
    pub sample_rate: Option<f64>,
    /// Token-bucket cap, spans per second, applied after rule sampling.
    pub rate_limit: f64,
    /// Ordered trace sampling rules; first match wins.
    pub sampling_rules: Vec<SamplingRule>,
    /// Header styles written on inject, in order.
    pub inject_styles: Vec<PropagationStyle>,
    /// Header styles attempted on extract, in order.
    pub extract_styles: Vec<PropagationStyle>,
    /// Stop at the first style that yields a context.
    pub extract_first: bool,
    pub partial_flush_enabled: bool,
    /// Finished-span threshold that triggers a partial flush.
    pub partial_flush_min_spans: usize,
    /// Compute client-side span stats and ship them to the agent.
    pub stats_computation_enabled: bool,
    pub data_streams_enabled: bool,
    pub span_pool_enabled: bool,
    /// Generate 128-bit trace ids with the start-time upper half.
    pub wide_trace_ids: bool,
    /// Tags applied to every started span.
    pub global_tags: HashMap<String, String>,
    /// Cap on the serialized propagating-tag header.
    pub tags_header_max_len: usize,
    /// Derive `peer.service` on eligible outbound spans.
    pub peer_service_defaults: bool,
    /// Renames applied to derived peer.service values.
    pub peer_service_mappings: HashMap<String, String>,
    /// Enable the runtime-metrics collaborator.
    pub runtime_metrics: bool,
    /// Tag profiler samples with span ids.
    pub profiler_hotspots: bool,
    /// Tag profiler samples with endpoint names.
    pub profiler_endpoints: bool,
    pub debug: bool,
    /// Log a one-line configuration summary at startup.
    pub log_startup: bool,
    /// Writer flush tick.
    #[serde(skip)]
    pub flush_interval: Duration,
    pub trace_max_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service: String::new(),
            env: None,
            version: None,
            hostname: None,
            agent_url: DEFAULT_AGENT_URL.to_string(),
            uds_path: None,
            agent_timeout: Duration::from_secs(10),
            sample_rate: None,
            rate_limit: 100.0,
            sampling_rules: Vec::new(),
            inject_styles: PropagationStyle::defaults(),
            extract_styles: PropagationStyle::defaults(),
            extract_first: false,
            partial_flush_enabled: false,
            partial_flush_min_spans: DEFAULT_PARTIAL_FLUSH_MIN_SPANS,
            stats_computation_enabled: false,
            data_streams_enabled: false,
            span_pool_enabled: false,
            wide_trace_ids: true,
            global_tags: HashMap::new(),
            tags_header_max_len: DEFAULT_TAGS_HEADER_MAX_LEN,
            peer_service_defaults: true,
            peer_service_mappings: HashMap::new(),
            runtime_metrics: false,
            profiler_hotspots: false,
            profiler_endpoints: false,
            debug: false,
            log_startup: true,
            flush_interval: Duration::from_secs(2),
            trace_max_size: TRACE_MAX_SIZE,
        }
    }
}

impl Config {
    /// Defaults overlaid with any `DD_*` environment variables present.
    pub fn from_env() -> Config {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("DD_SERVICE") {
            cfg.service = v;
        }
        if let Ok(v) = env::var("DD_ENV") {
            cfg.env = Some(v);
        }
        if let Ok(v) = env::var("DD_VERSION") {
            cfg.version = Some(v);
        }
        if let Ok(v) = env::var("DD_APM_RECEIVER_SOCKET") {
            cfg.uds_path = Some(v);
        }
        if let Ok(v) = env::var("DD_TRACE_AGENT_URL") {
            cfg.agent_url = v;
        } else {
            let host = env::var("DD_AGENT_HOST").unwrap_or_else(|_| "localhost".to_string());
            let port = env::var("DD_TRACE_AGENT_PORT").unwrap_or_else(|_| "8126".to_string());
            cfg.agent_url = format!("http://{}:{}", host, port);
        }
        if let Some(v) = env_f64("DD_TRACE_SAMPLE_RATE") {
            if (0.0..=1.0).contains(&v) {
                cfg.sample_rate = Some(v);
            } else {
                log::warn!("ignoring DD_TRACE_SAMPLE_RATE={} outside [0,1]", v);
            }
        }
        if let Some(v) = env_f64("DD_TRACE_RATE_LIMIT") {
            if v >= 0.0 {
                cfg.rate_limit = v;
            }
        }
        if let Ok(v) = env::var("DD_TRACE_SAMPLING_RULES") {
            match SamplingRule::parse_json(&v) {
                Ok(rules) => cfg.sampling_rules = rules,
                Err(e) => log::warn!("ignoring malformed DD_TRACE_SAMPLING_RULES: {}", e),
            }
        }
        if let Ok(v) = env::var("DD_TRACE_PROPAGATION_STYLE_INJECT") {
            cfg.inject_styles = PropagationStyle::parse_list(&v);
        }
        if let Ok(v) = env::var("DD_TRACE_PROPAGATION_STYLE_EXTRACT") {
            cfg.extract_styles = PropagationStyle::parse_list(&v);
        }
        if let Some(v) = env_bool("DD_TRACE_PROPAGATION_EXTRACT_FIRST") {
            cfg.extract_first = v;
        }
        if let Some(v) = env_bool("DD_TRACE_PARTIAL_FLUSH_ENABLED") {
            cfg.partial_flush_enabled = v;
        }
        if let Ok(v) = env::var("DD_TRACE_PARTIAL_FLUSH_MIN_SPANS") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => cfg.partial_flush_min_spans = n,
                _ => log::warn!("ignoring malformed DD_TRACE_PARTIAL_FLUSH_MIN_SPANS={}", v),
            }
        }
        if let Some(v) = env_bool("DD_TRACE_STATS_COMPUTATION_ENABLED") {
            cfg.stats_computation_enabled = v;
        }
        if let Some(v) = env_bool("DD_DATA_STREAMS_ENABLED") {
            cfg.data_streams_enabled = v;
        }
        if let Some(v) = env_bool("DD_TRACE_128_BIT_TRACEID_GENERATION_ENABLED") {
            cfg.wide_trace_ids = v;
        }
        if let Ok(v) = env::var("DD_TAGS") {
            cfg.global_tags.extend(parse_tag_list(&v));
        }
        if let Ok(v) = env::var("DD_TRACE_X_DATADOG_TAGS_MAX_LENGTH") {
            match v.parse::<usize>() {
                Ok(n) => cfg.tags_header_max_len = n,
                Err(_) => log::warn!("ignoring malformed DD_TRACE_X_DATADOG_TAGS_MAX_LENGTH={}", v),
            }
        }
        if let Some(v) = env_bool("DD_TRACE_PEER_SERVICE_DEFAULTS_ENABLED") {
            cfg.peer_service_defaults = v;
        }
        if let Ok(v) = env::var("DD_TRACE_PEER_SERVICE_MAPPING") {
            cfg.peer_service_mappings.extend(parse_tag_list(&v));
        }
        if let Some(v) = env_bool("DD_RUNTIME_METRICS_ENABLED") {
            cfg.runtime_metrics = v;
        }
        if let Some(v) = env_bool("DD_PROFILING_CODE_HOTSPOTS_COLLECTION_ENABLED") {
            cfg.profiler_hotspots = v;
        }
        if let Some(v) = env_bool("DD_PROFILING_ENDPOINT_COLLECTION_ENABLED") {
            cfg.profiler_endpoints = v;
        }
        if let Some(v) = env_bool("DD_TRACE_DEBUG") {
            cfg.debug = v;
        }
        if let Some(v) = env_bool("DD_TRACE_STARTUP_LOGS") {
            cfg.log_startup = v;
        }

        cfg
    }

    pub fn with_service<S: Into<String>>(mut self, service: S) -> Config {
        self.service = service.into();
        self
    }

    pub fn with_env<S: Into<String>>(mut self, env: S) -> Config {
        self.env = Some(env.into());
        self
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Config {
        self.version = Some(version.into());
        self
    }

    pub fn with_hostname<S: Into<String>>(mut self, hostname: S) -> Config {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_agent_url<S: Into<String>>(mut self, url: S) -> Config {
        self.agent_url = url.into();
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Config {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_uds_path<S: Into<String>>(mut self, path: S) -> Config {
        self.uds_path = Some(path.into());
        self
    }

    /// The effective agent endpoint; a configured unix socket wins over
    /// the TCP url.
    pub fn resolved_agent_url(&self) -> String {
        match &self.uds_path {
            Some(path) if !path.is_empty() => format!("unix://{}", path),
            _ => self.agent_url.clone(),
        }
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Config {
        if (0.0..=1.0).contains(&rate) {
            self.sample_rate = Some(rate);
        } else {
            log::warn!("ignoring sample rate {} outside [0,1]", rate);
        }
        self
    }

    pub fn with_rate_limit(mut self, spans_per_second: f64) -> Config {
        self.rate_limit = spans_per_second;
        self
    }

    pub fn with_sampling_rules(mut self, rules: Vec<SamplingRule>) -> Config {
        self.sampling_rules = rules;
        self
    }

    pub fn with_partial_flush(mut self, min_spans: usize) -> Config {
        self.partial_flush_enabled = true;
        self.partial_flush_min_spans = min_spans;
        self
    }

    pub fn with_global_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Config {
        self.global_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_propagation_styles(
        mut self,
        inject: Vec<PropagationStyle>,
        extract: Vec<PropagationStyle>,
    ) -> Config {
        self.inject_styles = inject;
        self.extract_styles = extract;
        self
    }

    /// The service name used for base-service comparisons, lowercased
    /// once so repeated comparisons stay cheap.
    pub fn service_lower(&self) -> String {
        self.service.to_lowercase()
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => {
            log::warn!("ignoring malformed {}={}", key, raw);
            None
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    let raw = env::var(key).ok()?;
    match raw.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring malformed {}={}", key, raw);
            None
        }
    }
}

/// Parse `k1:v1,k2:v2` (commas or spaces as separators) as used by
/// DD_TAGS and DD_TRACE_PEER_SERVICE_MAPPING.
pub fn parse_tag_list(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in raw.split(|c| c == ',' || c == ' ') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.find(':') {
            Some(idx) if idx > 0 => {
                out.insert(part[..idx].to_string(), part[idx + 1..].to_string());
            }
            _ => {
                out.insert(part.to_string(), String::new());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.agent_url, "http://localhost:8126");
        assert_eq!(cfg.trace_max_size, 100_000);
        assert_eq!(cfg.tags_header_max_len, 512);
        assert_eq!(cfg.partial_flush_min_spans, 1000);
        assert!(cfg.wide_trace_ids);
        assert!(!cfg.partial_flush_enabled);
    }

    #[test]
    fn test_sample_rate_bounds() {
        let cfg = Config::default().with_sample_rate(1.5);
        assert_eq!(cfg.sample_rate, None);
        let cfg = Config::default().with_sample_rate(0.25);
        assert_eq!(cfg.sample_rate, Some(0.25));
    }

    #[test]
    fn test_parse_tag_list() {
        let tags = parse_tag_list("env:prod,team:core version:1.2");
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(tags.get("team").map(String::as_str), Some("core"));
        assert_eq!(tags.get("version").map(String::as_str), Some("1.2"));
    }

    #[test]
    fn test_parse_tag_list_bare_key() {
        let tags = parse_tag_list("standalone");
        assert_eq!(tags.get("standalone").map(String::as_str), Some(""));
    }
}
