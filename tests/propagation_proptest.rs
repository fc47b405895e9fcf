//! Property tests for the propagation codecs

use std::collections::HashMap;

use proptest::prelude::*;

use meridian::{Config, PropagationStyle, Propagator, SpanContext, TraceId};

fn propagator(styles: Vec<PropagationStyle>) -> Propagator {
    Propagator::from_config(
        &Config::default().with_propagation_styles(styles.clone(), styles),
    )
}

// The "x" prefix keeps generated keys clear of reserved names like
// `_dd.p.tid`, which has its own parse path.
fn tag_map(prefix: &'static str) -> impl Strategy<Value = HashMap<String, String>> {
    proptest::collection::hash_map(
        "[a-z][a-z0-9]{0,6}".prop_map(move |k| format!("{}x{}", prefix, k)),
        "[a-zA-Z0-9._-]{1,12}",
        0..4,
    )
}

proptest! {
    #[test]
    fn datadog_round_trip(
        lower in 1u64..,
        upper in proptest::option::of(1u64..),
        span_id in 1u64..,
        priority in -1i32..=2,
        origin in proptest::option::of("[a-z]{1,10}"),
        tags in tag_map("_dd.p."),
        baggage in proptest::collection::hash_map(
            "[a-zA-Z][a-zA-Z0-9]{0,6}", "[ -~]{0,12}", 0..4),
    ) {
        let p = propagator(vec![PropagationStyle::Datadog]);
        let trace_id = TraceId::new(upper.unwrap_or(0), lower);
        let ctx = SpanContext::new_extracted(
            trace_id,
            span_id,
            origin.clone(),
            Some(priority as f64),
            baggage.clone(),
            tags.clone(),
            None,
        );

        let mut headers: HashMap<String, String> = HashMap::new();
        p.inject(&ctx, &mut headers).unwrap();
        let out = p.extract(&headers).unwrap();

        prop_assert_eq!(out.trace_id(), trace_id);
        prop_assert_eq!(out.span_id(), span_id);
        prop_assert_eq!(out.origin(), origin);
        prop_assert_eq!(out.sampling_priority(), Some(priority as f64));
        for (k, v) in &baggage {
            let item = out.baggage_item(&k.to_lowercase());
            prop_assert_eq!(item.as_deref(), Some(v.as_str()));
        }
        // Every propagating tag that fits the header cap survives.
        let bag_len: usize = tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        if bag_len < 500 {
            let out_tags = out.propagating_tags();
            for (k, v) in &tags {
                prop_assert_eq!(out_tags.get(k), Some(v));
            }
        }
    }

    #[test]
    fn tracecontext_round_trip(
        lower in 1u64..,
        upper in proptest::option::of(1u64..),
        span_id in 1u64..,
        priority in -1i32..=2,
        origin in proptest::option::of("[a-z]{1,10}"),
    ) {
        let p = propagator(vec![PropagationStyle::TraceContext]);
        let trace_id = TraceId::new(upper.unwrap_or(0), lower);
        let ctx = SpanContext::new_extracted(
            trace_id,
            span_id,
            origin.clone(),
            Some(priority as f64),
            HashMap::new(),
            HashMap::new(),
            None,
        );

        let mut headers: HashMap<String, String> = HashMap::new();
        p.inject(&ctx, &mut headers).unwrap();
        let out = p.extract(&headers).unwrap();

        prop_assert_eq!(out.trace_id(), trace_id);
        prop_assert_eq!(out.span_id(), span_id);
        prop_assert_eq!(out.origin(), origin);
        prop_assert_eq!(out.sampling_priority(), Some(priority as f64));
    }

    #[test]
    fn b3_round_trip(
        lower in 1u64..,
        span_id in 1u64..,
        sampled in proptest::bool::ANY,
    ) {
        for style in [PropagationStyle::B3Single, PropagationStyle::B3Multi] {
            let p = propagator(vec![style]);
            let ctx = SpanContext::new_extracted(
                TraceId::new(0, lower),
                span_id,
                None,
                Some(if sampled { 1.0 } else { 0.0 }),
                HashMap::new(),
                HashMap::new(),
                None,
            );
            let mut headers: HashMap<String, String> = HashMap::new();
            p.inject(&ctx, &mut headers).unwrap();
            let out = p.extract(&headers).unwrap();
            prop_assert_eq!(out.trace_id().lower, lower);
            prop_assert_eq!(out.span_id(), span_id);
            prop_assert_eq!(
                out.sampling_priority(),
                Some(if sampled { 1.0 } else { 0.0 })
            );
        }
    }

    #[test]
    fn extract_never_panics_on_garbage(
        keys in proptest::collection::vec("[a-zA-Z0-9-]{1,20}", 0..6),
        values in proptest::collection::vec("[ -~]{0,40}", 0..6),
    ) {
        let p = propagator(vec![
            PropagationStyle::Datadog,
            PropagationStyle::TraceContext,
            PropagationStyle::B3Single,
            PropagationStyle::B3Multi,
            PropagationStyle::Baggage,
        ]);
        let mut headers: HashMap<String, String> = HashMap::new();
        for (k, v) in keys.iter().zip(values.iter()) {
            headers.insert(k.clone(), v.clone());
        }
        // Garbage may or may not extract; it must never panic.
        let _ = p.extract(&headers);
    }
}
