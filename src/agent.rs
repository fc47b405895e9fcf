//! Agent feature discovery
//!
//! One `GET /info` at startup decides the static shape of the session:
//! which endpoints exist, whether the v0.5 trace wire is available, the
//! statsd port, and the feature-flag set. A handful of fields are
//! dynamic and re-polled every five seconds; on poll failure the
//! last-known-good values stay in place.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use serde_derive::Deserialize;

use crate::util::StopLatch;
use crate::writer::transport::Transport;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct InfoConfig {
    statsd_port: Option<u16>,
    default_env: Option<String>,
}

/// The `/info` response shape; unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub client_drop_p0s: bool,
    #[serde(default)]
    pub span_events: bool,
    #[serde(default)]
    pub span_meta_structs: bool,
    #[serde(default)]
    pub obfuscation_version: u32,
    #[serde(default)]
    pub peer_tags: Vec<String>,
    #[serde(default)]
    pub feature_flags: Vec<String>,
    #[serde(default)]
    config: InfoConfig,
}

/// Discovered agent capabilities, shared across the runtime.
///
/// Static fields are written once at startup; dynamic fields are
/// refreshed by the poller.
pub struct AgentFeatures {
    discovered: AtomicBool,
    // static
    has_v05_traces: AtomicBool,
    has_stats: AtomicBool,
    has_pipeline_stats: AtomicBool,
    has_evp_proxy: AtomicBool,
    meta_structs: AtomicBool,
    statsd_port: AtomicU32,
    default_env: RwLock<Option<String>>,
    feature_flags: RwLock<Vec<String>>,
    // dynamic
    client_drop_p0s: AtomicBool,
    span_events: AtomicBool,
    obfuscation_version: AtomicU32,
    peer_tags: RwLock<Vec<String>>,
}

impl AgentFeatures {
    /// Conservative defaults used until (or in lieu of) discovery:
    /// v0.4 wire, no stats shipping, no drops.
    pub fn unknown() -> AgentFeatures {
        AgentFeatures {
            discovered: AtomicBool::new(false),
            has_v05_traces: AtomicBool::new(false),
            has_stats: AtomicBool::new(false),
            has_pipeline_stats: AtomicBool::new(false),
            has_evp_proxy: AtomicBool::new(false),
            meta_structs: AtomicBool::new(false),
            statsd_port: AtomicU32::new(8125),
            default_env: RwLock::new(None),
            feature_flags: RwLock::new(Vec::new()),
            client_drop_p0s: AtomicBool::new(false),
            span_events: AtomicBool::new(false),
            obfuscation_version: AtomicU32::new(0),
            peer_tags: RwLock::new(Vec::new()),
        }
    }

    /// Startup discovery: applies both static and dynamic fields.
    pub fn discover(&self, transport: &dyn Transport) {
        match fetch(transport) {
            Ok(info) => {
                self.apply_static(&info);
                self.apply_dynamic(&info);
                self.discovered.store(true, Ordering::Release);
                log::debug!(
                    "agent discovered: v0.5={} stats={} drop_p0s={}",
                    self.has_v05_traces(),
                    self.has_stats(),
                    self.client_drop_p0s()
                );
            }
            Err(e) => {
                log::warn!("agent feature discovery failed, using defaults: {}", e);
            }
        }
    }

    /// Periodic refresh: only the dynamic fields may change.
    pub fn poll_dynamic(&self, transport: &dyn Transport) {
        match fetch(transport) {
            Ok(info) => self.apply_dynamic(&info),
            Err(e) => {
                // Last-known-good dynamic values stay in place.
                log::debug!("agent feature poll failed: {}", e);
            }
        }
    }

    fn apply_static(&self, info: &AgentInfo) {
        let has = |suffix: &str| info.endpoints.iter().any(|e| e.ends_with(suffix));
        self.has_v05_traces
            .store(has("/v0.5/traces"), Ordering::Release);
        self.has_stats.store(has("/v0.6/stats"), Ordering::Release);
        self.has_pipeline_stats
            .store(has("/pipeline_stats"), Ordering::Release);
        self.has_evp_proxy
            .store(info.endpoints.iter().any(|e| e.contains("/evp_proxy/")), Ordering::Release);
        self.meta_structs
            .store(info.span_meta_structs, Ordering::Release);
        if let Some(port) = info.config.statsd_port {
            self.statsd_port.store(port as u32, Ordering::Release);
        }
        *self.default_env.write() = info.config.default_env.clone();
        *self.feature_flags.write() = info.feature_flags.clone();
    }

    fn apply_dynamic(&self, info: &AgentInfo) {
        self.client_drop_p0s
            .store(info.client_drop_p0s, Ordering::Release);
        self.span_events.store(info.span_events, Ordering::Release);
        self.obfuscation_version
            .store(info.obfuscation_version, Ordering::Release);
        *self.peer_tags.write() = info.peer_tags.clone();
    }

    pub fn is_discovered(&self) -> bool {
        self.discovered.load(Ordering::Acquire)
    }

    pub fn has_v05_traces(&self) -> bool {
        self.has_v05_traces.load(Ordering::Acquire)
    }

    /// Permanently fall back to the v0.4 wire, after a 404.
    pub fn downgrade_traces(&self) {
        self.has_v05_traces.store(false, Ordering::Release);
    }

    pub fn has_stats(&self) -> bool {
        self.has_stats.load(Ordering::Acquire)
    }

    pub fn has_pipeline_stats(&self) -> bool {
        self.has_pipeline_stats.load(Ordering::Acquire)
    }

    pub fn has_evp_proxy(&self) -> bool {
        self.has_evp_proxy.load(Ordering::Acquire)
    }

    pub fn supports_meta_structs(&self) -> bool {
        self.meta_structs.load(Ordering::Acquire)
    }

    pub fn statsd_port(&self) -> u16 {
        self.statsd_port.load(Ordering::Acquire) as u16
    }

    pub fn default_env(&self) -> Option<String> {
        self.default_env.read().clone()
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.feature_flags.read().iter().any(|f| f == flag)
    }

    pub fn client_drop_p0s(&self) -> bool {
        self.client_drop_p0s.load(Ordering::Acquire)
    }

    pub fn supports_span_events(&self) -> bool {
        self.span_events.load(Ordering::Acquire)
    }

    pub fn obfuscation_version(&self) -> u32 {
        self.obfuscation_version.load(Ordering::Acquire)
    }

    pub fn peer_tags(&self) -> Vec<String> {
        self.peer_tags.read().clone()
    }
}

fn fetch(transport: &dyn Transport) -> Result<AgentInfo, String> {
    let value = transport.fetch_info().map_err(|e| e.to_string())?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Spawn the discovery-then-poll worker. The startup discovery happens
/// off the caller's thread so an absent agent cannot stall tracer
/// start; the worker exits when the latch trips.
pub(crate) fn start_poller(
    features: Arc<AgentFeatures>,
    transport: Arc<dyn Transport>,
    stop: Arc<StopLatch>,
) -> JoinHandle<()> {
    Builder::new()
        .name("meridian-agent-poll".to_string())
        .spawn(move || {
            features.discover(transport.as_ref());
            while !stop.wait_timeout(POLL_INTERVAL) {
                features.poll_dynamic(transport.as_ref());
            }
        })
        .expect("failed to spawn agent poller thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_from(json: &str) -> AgentInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_info() {
        let info = info_from(
            r#"{
                "endpoints": ["/v0.4/traces", "/v0.5/traces", "/v0.6/stats", "/evp_proxy/v2/"],
                "client_drop_p0s": true,
                "span_events": true,
                "span_meta_structs": true,
                "obfuscation_version": 2,
                "peer_tags": ["db.name"],
                "feature_flags": ["discovery"],
                "config": {"statsd_port": 8135, "default_env": "prod"}
            }"#,
        );
        let features = AgentFeatures::unknown();
        features.apply_static(&info);
        features.apply_dynamic(&info);
        assert!(features.has_v05_traces());
        assert!(features.has_stats());
        assert!(features.has_evp_proxy());
        assert!(features.supports_meta_structs());
        assert!(features.client_drop_p0s());
        assert!(features.supports_span_events());
        assert_eq!(features.obfuscation_version(), 2);
        assert_eq!(features.statsd_port(), 8135);
        assert_eq!(features.default_env().as_deref(), Some("prod"));
        assert!(features.has_flag("discovery"));
        assert_eq!(features.peer_tags(), vec!["db.name".to_string()]);
    }

    #[test]
    fn test_unknown_defaults() {
        let features = AgentFeatures::unknown();
        assert!(!features.has_v05_traces());
        assert!(!features.has_stats());
        assert!(!features.client_drop_p0s());
        assert_eq!(features.statsd_port(), 8125);
    }

    #[test]
    fn test_static_fields_not_touched_by_dynamic_apply() {
        let features = AgentFeatures::unknown();
        features.apply_static(&info_from(r#"{"endpoints": ["/v0.5/traces"]}"#));
        assert!(features.has_v05_traces());
        // A later poll response without endpoints must not flip the
        // startup decision.
        features.apply_dynamic(&info_from(r#"{"client_drop_p0s": true}"#));
        assert!(features.has_v05_traces());
        assert!(features.client_drop_p0s());
    }

    #[test]
    fn test_downgrade() {
        let features = AgentFeatures::unknown();
        features.apply_static(&info_from(r#"{"endpoints": ["/v0.5/traces"]}"#));
        features.downgrade_traces();
        assert!(!features.has_v05_traces());
    }
}
