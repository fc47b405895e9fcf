//! Peer service derivation
//!
//! Outbound spans (client or producer kind) without an explicit
//! `peer.service` get one derived from the most specific attribute
//! available, walking a fixed source list. Derivation runs at finish,
//! under the span's write lock, so it sees the final tag set.

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use crate::trace::config::Config;
use crate::trace::span::SpanState;
use crate::trace::KEY_BASE_SERVICE;

/// Attribute sources tried in order for AWS-tagged spans.
const AWS_SOURCES: &[&str] = &[
    "queuename",
    "topicname",
    "streamname",
    "tablename",
    "bucketname",
];

/// Generic sources tried in order after the specific integrations.
const FALLBACK_SOURCES: &[&str] = &["destination.name", "peer.hostname", "target.host"];

const SERVICE_CACHE_CAP: usize = 1000;

lazy_static! {
    // Lowercased service names, so the base-service comparison does not
    // re-lowercase the same handful of strings on every finish. Bounded
    // with random eviction.
    static ref SERVICE_LOWER_CACHE: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

fn lowercased(service: &str) -> String {
    let mut cache = SERVICE_LOWER_CACHE.lock();
    if let Some(hit) = cache.get(service) {
        return hit.clone();
    }
    let lower = service.to_lowercase();
    if cache.len() >= SERVICE_CACHE_CAP {
        let victim = cache.keys().choose(&mut rand::thread_rng()).cloned();
        if let Some(victim) = victim {
            cache.remove(&victim);
        }
    }
    cache.insert(service.to_string(), lower.clone());
    lower
}

/// Finish-path tag processing: base-service stamping and peer.service
/// derivation. The caller holds the span's write lock.
pub(crate) fn process_finished_span(cfg: &Config, state: &mut SpanState) {
    if !cfg.service.is_empty() && lowercased(&state.service) != lowercased(&cfg.service) {
        state
            .meta
            .insert(KEY_BASE_SERVICE.to_string(), cfg.service.clone());
    }

    if cfg.peer_service_defaults {
        derive_peer_service(cfg, state);
    }
}

fn is_outbound(state: &SpanState) -> bool {
    matches!(
        state.meta.get("span.kind").map(String::as_str),
        Some("client") | Some("producer")
    )
}

fn derive_peer_service(cfg: &Config, state: &mut SpanState) {
    if !is_outbound(state) {
        return;
    }

    let derived = if state.meta.contains_key("peer.service") {
        None
    } else {
        pick_source(state)
    };

    if let Some((source, value)) = derived {
        state.meta.insert("peer.service".to_string(), value);
        state
            .meta
            .insert("_dd.peer.service.source".to_string(), source.to_string());
    }

    let current = match state.meta.get("peer.service") {
        Some(v) => v.clone(),
        None => return,
    };
    if let Some(mapped) = cfg.peer_service_mappings.get(&current) {
        state
            .meta
            .insert("peer.service".to_string(), mapped.clone());
        state
            .meta
            .insert("_dd.peer.service.remapped_from".to_string(), current);
    }
}

fn pick_source(state: &SpanState) -> Option<(&'static str, String)> {
    let get = |key: &str| {
        state
            .meta
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
    };

    if state.meta.contains_key("aws_service") {
        for key in AWS_SOURCES {
            if let Some(v) = get(key) {
                return Some((name_of(key), v));
            }
        }
    } else if state.meta.get("db.system").map(String::as_str) == Some("cassandra") {
        if let Some(v) = get("db.cassandra.contact.points") {
            return Some(("db.cassandra.contact.points", v));
        }
    } else if let Some(v) = get("db.name") {
        return Some(("db.name", v));
    } else if let Some(v) = get("db.instance") {
        return Some(("db.instance", v));
    } else if let Some(v) = get("messaging.kafka.bootstrap.servers") {
        return Some(("messaging.kafka.bootstrap.servers", v));
    } else if let Some(v) = get("rpc.service") {
        return Some(("rpc.service", v));
    }

    for key in FALLBACK_SOURCES {
        if let Some(v) = get(key) {
            return Some((name_of(key), v));
        }
    }
    None
}

// Map back to the 'static name so the source tag can borrow it.
fn name_of(key: &str) -> &'static str {
    for k in AWS_SOURCES.iter().chain(FALLBACK_SOURCES.iter()) {
        if *k == key {
            return *k;
        }
    }
    "unknown"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn state_with(pairs: &[(&str, &str)]) -> SpanState {
        let mut meta = HashMap::new();
        for (k, v) in pairs {
            meta.insert(k.to_string(), v.to_string());
        }
        SpanState {
            operation: "op".to_string(),
            service: "svc".to_string(),
            resource: "res".to_string(),
            span_type: String::new(),
            start: 0,
            duration: 0,
            error: 0,
            meta,
            metrics: HashMap::new(),
            links: Vec::new(),
            events: Vec::new(),
            finished: false,
        }
    }

    #[test]
    fn test_base_service_stamped_case_insensitive() {
        let cfg = Config::default().with_service("Frontend");
        let mut state = state_with(&[]);
        state.service = "frontend".to_string();
        process_finished_span(&cfg, &mut state);
        assert!(state.meta.get(KEY_BASE_SERVICE).is_none());

        state.service = "db-client".to_string();
        process_finished_span(&cfg, &mut state);
        assert_eq!(
            state.meta.get(KEY_BASE_SERVICE).map(String::as_str),
            Some("Frontend")
        );
    }

    #[test]
    fn test_aws_source_wins() {
        let cfg = Config::default().with_service("svc");
        let mut state = state_with(&[
            ("span.kind", "client"),
            ("aws_service", "sqs"),
            ("queuename", "jobs"),
            ("peer.hostname", "10.0.0.1"),
        ]);
        process_finished_span(&cfg, &mut state);
        assert_eq!(state.meta.get("peer.service").map(String::as_str), Some("jobs"));
        assert_eq!(
            state.meta.get("_dd.peer.service.source").map(String::as_str),
            Some("queuename")
        );
    }

    #[test]
    fn test_db_and_fallback_sources() {
        let cfg = Config::default().with_service("svc");
        let mut state = state_with(&[("span.kind", "client"), ("db.name", "users")]);
        process_finished_span(&cfg, &mut state);
        assert_eq!(state.meta.get("peer.service").map(String::as_str), Some("users"));

        let mut state = state_with(&[("span.kind", "producer"), ("peer.hostname", "kafka-1")]);
        process_finished_span(&cfg, &mut state);
        assert_eq!(
            state.meta.get("peer.service").map(String::as_str),
            Some("kafka-1")
        );
    }

    #[test]
    fn test_inbound_spans_skipped() {
        let cfg = Config::default().with_service("svc");
        let mut state = state_with(&[("span.kind", "server"), ("db.name", "users")]);
        process_finished_span(&cfg, &mut state);
        assert!(state.meta.get("peer.service").is_none());
    }

    #[test]
    fn test_explicit_peer_service_only_remapped() {
        let mut cfg = Config::default().with_service("svc");
        cfg.peer_service_mappings
            .insert("legacy-db".to_string(), "users-db".to_string());
        let mut state = state_with(&[
            ("span.kind", "client"),
            ("peer.service", "legacy-db"),
            ("db.name", "ignored"),
        ]);
        process_finished_span(&cfg, &mut state);
        assert_eq!(
            state.meta.get("peer.service").map(String::as_str),
            Some("users-db")
        );
        assert_eq!(
            state.meta.get("_dd.peer.service.remapped_from").map(String::as_str),
            Some("legacy-db")
        );
        assert!(state.meta.get("_dd.peer.service.source").is_none());
    }
}
