//! Context propagation across process boundaries
//!
//! Injection writes a span context into a carrier using every
//! configured header style; extraction tries styles in order and merges
//! agreeing results. Errors surface as one of four sentinels and never
//! abort the remaining styles.
//!
//! # Module Structure
//!
//! * `carrier` - reader/writer abstractions over header maps
//! * `datadog` - Datadog-native headers
//! * `tracecontext` - W3C traceparent/tracestate
//! * `b3` - B3 single and multi headers
//! * `baggage` - W3C baggage

/// B3 single- and multi-header codec
pub mod b3;

/// W3C baggage codec
pub mod baggage;

/// Carrier reader/writer abstractions
pub mod carrier;

/// Datadog-native header codec
pub mod datadog;

/// W3C traceparent/tracestate codec
pub mod tracecontext;

use std::collections::HashMap;

use derive_more::{Display, Error};

use crate::propagation::carrier::{TextMapReader, TextMapWriter};
use crate::trace::config::Config;
use crate::trace::context::SpanContext;
use crate::trace::id::TraceId;
use crate::trace::KEY_PROPAGATION_ERROR;

/// Propagation failures surfaced to callers.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum PropagationError {
    #[display(fmt = "invalid carrier")]
    InvalidCarrier,
    #[display(fmt = "invalid span context")]
    InvalidSpanContext,
    #[display(fmt = "span context corrupted")]
    Corrupted,
    #[display(fmt = "span context not found")]
    NotFound,
}

/// A header style understood by the propagator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStyle {
    Datadog,
    TraceContext,
    B3Single,
    B3Multi,
    Baggage,
    None,
}

impl<'de> serde::Deserialize<'de> for PropagationStyle {
    fn deserialize<D>(deserializer: D) -> Result<PropagationStyle, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        match raw.trim().to_lowercase().as_str() {
            "datadog" => Ok(PropagationStyle::Datadog),
            "tracecontext" => Ok(PropagationStyle::TraceContext),
            "b3" => Ok(PropagationStyle::B3Single),
            "b3multi" => Ok(PropagationStyle::B3Multi),
            "baggage" => Ok(PropagationStyle::Baggage),
            "none" => Ok(PropagationStyle::None),
            other => Err(serde::de::Error::custom(format!(
                "unknown propagation style {:?}",
                other
            ))),
        }
    }
}

impl PropagationStyle {
    /// Default style set for both directions.
    pub fn defaults() -> Vec<PropagationStyle> {
        vec![
            PropagationStyle::Datadog,
            PropagationStyle::TraceContext,
            PropagationStyle::Baggage,
        ]
    }

    /// Parse a comma-separated style list. Unknown names are skipped
    /// with a warning.
    pub fn parse_list(raw: &str) -> Vec<PropagationStyle> {
        let mut out = Vec::new();
        for name in raw.split(',') {
            let name = name.trim().to_lowercase();
            if name.is_empty() {
                continue;
            }
            match name.as_str() {
                "datadog" => out.push(PropagationStyle::Datadog),
                "tracecontext" => out.push(PropagationStyle::TraceContext),
                "b3" => out.push(PropagationStyle::B3Single),
                "b3multi" => out.push(PropagationStyle::B3Multi),
                "baggage" => out.push(PropagationStyle::Baggage),
                "none" => out.push(PropagationStyle::None),
                other => log::warn!("ignoring unknown propagation style {:?}", other),
            }
        }
        out
    }
}

/// Raw result of one extraction style, before context assembly.
#[derive(Default)]
pub(crate) struct Extracted {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub origin: Option<String>,
    pub priority: Option<f64>,
    pub baggage: HashMap<String, String>,
    pub propagating_tags: HashMap<String, String>,
    pub reparent_id: Option<String>,
    pub w3c_tracestate: Option<String>,
    pub malformed_tid: bool,
}

/// The configured injection/extraction pipeline.
pub struct Propagator {
    inject_styles: Vec<PropagationStyle>,
    extract_styles: Vec<PropagationStyle>,
    extract_first: bool,
    max_tags_len: usize,
}

impl Propagator {
    pub fn from_config(cfg: &Config) -> Propagator {
        Propagator {
            inject_styles: cfg.inject_styles.clone(),
            extract_styles: cfg.extract_styles.clone(),
            extract_first: cfg.extract_first,
            max_tags_len: cfg.tags_header_max_len,
        }
    }

    pub fn inject(
        &self,
        ctx: &SpanContext,
        carrier: &mut dyn TextMapWriter,
    ) -> Result<(), PropagationError> {
        if ctx.trace_id().is_zero() || ctx.span_id() == 0 {
            return Err(PropagationError::InvalidSpanContext);
        }
        for style in &self.inject_styles {
            match style {
                PropagationStyle::Datadog => datadog::inject(ctx, carrier, self.max_tags_len),
                PropagationStyle::TraceContext => tracecontext::inject(ctx, carrier),
                PropagationStyle::B3Single => b3::inject_single(ctx, carrier),
                PropagationStyle::B3Multi => b3::inject_multi(ctx, carrier),
                PropagationStyle::Baggage => baggage::inject(ctx, carrier),
                PropagationStyle::None => {}
            }
        }
        Ok(())
    }

    pub fn extract(&self, reader: &dyn TextMapReader) -> Result<SpanContext, PropagationError> {
        let mut primary: Option<(PropagationStyle, Extracted)> = None;
        let mut first_err: Option<PropagationError> = None;
        let mut baggage: HashMap<String, String> = HashMap::new();

        for style in &self.extract_styles {
            let result = match style {
                PropagationStyle::Datadog => datadog::extract(reader),
                PropagationStyle::TraceContext => tracecontext::extract(reader),
                PropagationStyle::B3Single => b3::extract_single(reader),
                PropagationStyle::B3Multi => b3::extract_multi(reader),
                PropagationStyle::Baggage => {
                    baggage.extend(baggage::extract(reader));
                    continue;
                }
                PropagationStyle::None => continue,
            };
            match result {
                Ok(extracted) => match &mut primary {
                    None => {
                        primary = Some((*style, extracted));
                        if self.extract_first {
                            break;
                        }
                    }
                    Some((_, kept)) => merge(kept, extracted, *style),
                },
                Err(PropagationError::NotFound) => {}
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        match primary {
            Some((_, mut extracted)) => {
                extracted.baggage.extend(baggage);
                Ok(assemble(extracted))
            }
            None if !baggage.is_empty() => {
                // Baggage has no trace identity of its own; the caller
                // gets a context carrying only the items.
                Ok(SpanContext::new_extracted(
                    TraceId::default(),
                    0,
                    None,
                    None,
                    baggage,
                    HashMap::new(),
                    None,
                ))
            }
            None => Err(first_err.unwrap_or(PropagationError::NotFound)),
        }
    }
}

/// Reconcile a later style's result into the primary one. Only W3C
/// trace context contributes when the trace ids agree: its span id wins
/// (the Datadog parent is retained as the reparent id through the
/// tracestate `p` subkey), its foreign tracestate is adopted, and its
/// tags fill gaps. On id mismatch the later result is ignored.
fn merge(primary: &mut Extracted, other: Extracted, style: PropagationStyle) {
    if style != PropagationStyle::TraceContext {
        return;
    }
    if primary.trace_id.lower != other.trace_id.lower {
        return;
    }
    primary.span_id = other.span_id;
    primary.reparent_id = other.reparent_id;
    primary.w3c_tracestate = other.w3c_tracestate;
    primary.malformed_tid |= other.malformed_tid;
    if primary.trace_id.upper == 0 {
        primary.trace_id.upper = other.trace_id.upper;
    }
    for (k, v) in other.propagating_tags {
        primary.propagating_tags.entry(k).or_insert(v);
    }
}

fn assemble(extracted: Extracted) -> SpanContext {
    let malformed = extracted.malformed_tid;
    let tracestate = extracted.w3c_tracestate.clone();
    let ctx = SpanContext::new_extracted(
        extracted.trace_id,
        extracted.span_id,
        extracted.origin,
        extracted.priority,
        extracted.baggage,
        extracted.propagating_tags,
        extracted.reparent_id,
    );
    if malformed {
        ctx.trace()
            .set_trace_tag(KEY_PROPAGATION_ERROR, "malformed_tid");
    }
    if let Some(ts) = tracestate {
        ctx.trace().set_w3c_tracestate(&ts);
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn propagator(styles: &[PropagationStyle]) -> Propagator {
        Propagator {
            inject_styles: styles.to_vec(),
            extract_styles: styles.to_vec(),
            extract_first: false,
            max_tags_len: 512,
        }
    }

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_list() {
        let styles = PropagationStyle::parse_list("datadog, tracecontext,b3,b3multi,bogus,none");
        assert_eq!(
            styles,
            vec![
                PropagationStyle::Datadog,
                PropagationStyle::TraceContext,
                PropagationStyle::B3Single,
                PropagationStyle::B3Multi,
                PropagationStyle::None,
            ]
        );
    }

    #[test]
    fn test_extract_not_found() {
        let p = propagator(&PropagationStyle::defaults());
        let empty = carrier(&[]);
        assert!(matches!(
            p.extract(&empty),
            Err(PropagationError::NotFound)
        ));
    }

    #[test]
    fn test_extract_corrupted_surfaces_after_all_styles() {
        let p = propagator(&[PropagationStyle::Datadog, PropagationStyle::TraceContext]);
        let headers = carrier(&[("x-datadog-trace-id", "not-a-number")]);
        assert!(matches!(
            p.extract(&headers),
            Err(PropagationError::Corrupted)
        ));

        // A corrupted first style does not mask a healthy second one.
        let headers = carrier(&[
            ("x-datadog-trace-id", "not-a-number"),
            (
                "traceparent",
                "00-00000000000000000000000000000007-00000000000000aa-01",
            ),
        ]);
        let ctx = p.extract(&headers).unwrap();
        assert_eq!(ctx.trace_id().lower, 7);
        assert_eq!(ctx.span_id(), 0xaa);
    }

    #[test]
    fn test_w3c_reparenting_merge() {
        let p = propagator(&[PropagationStyle::Datadog, PropagationStyle::TraceContext]);
        let headers = carrier(&[
            ("x-datadog-trace-id", "4"),
            ("x-datadog-parent-id", "1"),
            ("x-datadog-origin", "synthetics"),
            ("x-datadog-sampling-priority", "2"),
            (
                "traceparent",
                "00-00000000000000000000000000000004-2222222222222222-01",
            ),
            (
                "tracestate",
                "dd=s:2;o:rum;p:0000000000000001;t.tid:1230000000000000,othervendor=t61rcWkgMzE",
            ),
        ]);
        let ctx = p.extract(&headers).unwrap();
        assert_eq!(ctx.trace_id().lower, 4);
        assert_eq!(ctx.span_id(), 0x2222_2222_2222_2222);
        assert_eq!(ctx.reparent_id().as_deref(), Some("0000000000000001"));
        // The first extractor's origin wins.
        assert_eq!(ctx.origin().as_deref(), Some("synthetics"));
        assert_eq!(
            ctx.trace().w3c_tracestate().as_deref(),
            Some("othervendor=t61rcWkgMzE")
        );
    }

    #[test]
    fn test_trace_id_mismatch_ignores_tracestate() {
        let p = propagator(&[PropagationStyle::Datadog, PropagationStyle::TraceContext]);
        let headers = carrier(&[
            ("x-datadog-trace-id", "4"),
            ("x-datadog-parent-id", "1"),
            (
                "traceparent",
                "00-00000000000000000000000000000009-2222222222222222-01",
            ),
            ("tracestate", "dd=p:0000000000000003,othervendor=abc"),
        ]);
        let ctx = p.extract(&headers).unwrap();
        assert_eq!(ctx.trace_id().lower, 4);
        assert_eq!(ctx.span_id(), 1);
        assert!(ctx.reparent_id().is_none());
        assert!(ctx.trace().w3c_tracestate().is_none());
    }

    #[test]
    fn test_extract_first_stops_early() {
        let mut p = propagator(&[PropagationStyle::Datadog, PropagationStyle::TraceContext]);
        p.extract_first = true;
        let headers = carrier(&[
            ("x-datadog-trace-id", "4"),
            ("x-datadog-parent-id", "1"),
            (
                "traceparent",
                "00-00000000000000000000000000000004-2222222222222222-01",
            ),
        ]);
        let ctx = p.extract(&headers).unwrap();
        assert_eq!(ctx.span_id(), 1);
    }

    #[test]
    fn test_inject_rejects_zero_ids() {
        let p = propagator(&PropagationStyle::defaults());
        let ctx = SpanContext::new_extracted(
            TraceId::default(),
            0,
            None,
            None,
            HashMap::new(),
            HashMap::new(),
            None,
        );
        let mut out: HashMap<String, String> = HashMap::new();
        assert!(matches!(
            p.inject(&ctx, &mut out),
            Err(PropagationError::InvalidSpanContext)
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_round_trip_datadog() {
        let p = propagator(&[PropagationStyle::Datadog]);
        let mut tags = HashMap::new();
        tags.insert("_dd.p.dm".to_string(), "-4".to_string());
        tags.insert("_dd.p.usr.id".to_string(), "baz64".to_string());
        let mut bag = HashMap::new();
        bag.insert("account".to_string(), "42".to_string());
        let ctx = SpanContext::new_extracted(
            TraceId::new(0x0123_4567_0000_0000, 99),
            7,
            Some("synthetics".to_string()),
            Some(1.0),
            bag,
            tags,
            None,
        );
        let mut headers: HashMap<String, String> = HashMap::new();
        p.inject(&ctx, &mut headers).unwrap();

        let out = p.extract(&headers).unwrap();
        assert_eq!(out.trace_id(), ctx.trace_id());
        assert_eq!(out.span_id(), 7);
        assert_eq!(out.origin().as_deref(), Some("synthetics"));
        assert_eq!(out.sampling_priority(), Some(1.0));
        assert_eq!(out.baggage_item("account").as_deref(), Some("42"));
        assert_eq!(
            out.propagating_tags().get("_dd.p.usr.id").map(String::as_str),
            Some("baz64")
        );
    }

    #[test]
    fn test_round_trip_tracecontext() {
        let p = propagator(&[PropagationStyle::TraceContext]);
        let mut tags = HashMap::new();
        tags.insert("_dd.p.dm".to_string(), "-1".to_string());
        let ctx = SpanContext::new_extracted(
            TraceId::new(5, 6),
            7,
            Some("rum".to_string()),
            Some(2.0),
            HashMap::new(),
            tags,
            None,
        );
        let mut headers: HashMap<String, String> = HashMap::new();
        p.inject(&ctx, &mut headers).unwrap();
        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-00000000000000050000000000000006-0000000000000007-01")
        );

        let out = p.extract(&headers).unwrap();
        assert_eq!(out.trace_id(), ctx.trace_id());
        assert_eq!(out.span_id(), 7);
        assert_eq!(out.origin().as_deref(), Some("rum"));
        assert_eq!(out.sampling_priority(), Some(2.0));
        assert_eq!(out.reparent_id().as_deref(), Some("0000000000000007"));
        assert_eq!(
            out.propagating_tags().get("_dd.p.dm").map(String::as_str),
            Some("-1")
        );
    }
}
