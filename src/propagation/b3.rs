//! B3 propagation, single-header and multi-header variants

use crate::propagation::carrier::{TextMapReader, TextMapWriter};
use crate::propagation::{Extracted, PropagationError};
use crate::trace::context::SpanContext;
use crate::trace::id::{parse_hex64, TraceId};

pub const HEADER_B3_SINGLE: &str = "b3";
pub const HEADER_B3_TRACE_ID: &str = "x-b3-traceid";
pub const HEADER_B3_SPAN_ID: &str = "x-b3-spanid";
pub const HEADER_B3_SAMPLED: &str = "x-b3-sampled";

fn trace_id_hex(trace_id: TraceId) -> String {
    if trace_id.upper != 0 {
        trace_id.to_hex32()
    } else {
        format!("{:016x}", trace_id.lower)
    }
}

fn sampled_bit(ctx: &SpanContext) -> &'static str {
    match ctx.sampling_priority() {
        Some(p) if p > 0.0 => "1",
        _ => "0",
    }
}

pub(crate) fn inject_multi(ctx: &SpanContext, carrier: &mut dyn TextMapWriter) {
    carrier.set(HEADER_B3_TRACE_ID, &trace_id_hex(ctx.trace_id()));
    carrier.set(HEADER_B3_SPAN_ID, &format!("{:016x}", ctx.span_id()));
    carrier.set(HEADER_B3_SAMPLED, sampled_bit(ctx));
}

pub(crate) fn inject_single(ctx: &SpanContext, carrier: &mut dyn TextMapWriter) {
    carrier.set(
        HEADER_B3_SINGLE,
        &format!(
            "{}-{:016x}-{}",
            trace_id_hex(ctx.trace_id()),
            ctx.span_id(),
            sampled_bit(ctx)
        ),
    );
}

fn parse_trace_id(raw: &str) -> Result<TraceId, PropagationError> {
    let raw = raw.trim();
    let id = match raw.len() {
        32 => TraceId::from_hex32(&raw.to_lowercase()).ok_or(PropagationError::Corrupted)?,
        1..=16 => TraceId::new(0, parse_hex64(raw).ok_or(PropagationError::Corrupted)?),
        _ => return Err(PropagationError::Corrupted),
    };
    if id.is_zero() {
        return Err(PropagationError::Corrupted);
    }
    Ok(id)
}

fn parse_sampled(raw: &str) -> Option<f64> {
    match raw.trim() {
        "1" | "d" | "true" => Some(1.0),
        "0" | "false" => Some(0.0),
        _ => None,
    }
}

pub(crate) fn extract_multi(reader: &dyn TextMapReader) -> Result<Extracted, PropagationError> {
    let trace_raw = reader
        .get(HEADER_B3_TRACE_ID)
        .ok_or(PropagationError::NotFound)?;
    let span_raw = reader
        .get(HEADER_B3_SPAN_ID)
        .ok_or(PropagationError::Corrupted)?;

    let mut extracted = Extracted::default();
    extracted.trace_id = parse_trace_id(&trace_raw)?;
    extracted.span_id = parse_hex64(span_raw.trim()).ok_or(PropagationError::Corrupted)?;
    if let Some(sampled) = reader.get(HEADER_B3_SAMPLED) {
        extracted.priority = parse_sampled(&sampled);
    }
    Ok(extracted)
}

pub(crate) fn extract_single(reader: &dyn TextMapReader) -> Result<Extracted, PropagationError> {
    let raw = reader
        .get(HEADER_B3_SINGLE)
        .ok_or(PropagationError::NotFound)?;
    let raw = raw.trim();
    // "0" is an explicit deny-all with no identity attached.
    if raw == "0" {
        return Err(PropagationError::NotFound);
    }
    let parts: Vec<&str> = raw.split('-').collect();
    if parts.len() < 2 {
        return Err(PropagationError::Corrupted);
    }
    let mut extracted = Extracted::default();
    extracted.trace_id = parse_trace_id(parts[0])?;
    extracted.span_id = parse_hex64(parts[1]).ok_or(PropagationError::Corrupted)?;
    if parts.len() > 2 {
        extracted.priority = parse_sampled(parts[2]);
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn reader(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_multi() {
        let carrier = reader(&[
            ("x-b3-traceid", "00000000000000ff"),
            ("x-b3-spanid", "0000000000000001"),
            ("x-b3-sampled", "1"),
        ]);
        let out = extract_multi(&carrier).unwrap();
        assert_eq!(out.trace_id, TraceId::new(0, 0xff));
        assert_eq!(out.span_id, 1);
        assert_eq!(out.priority, Some(1.0));
    }

    #[test]
    fn test_extract_multi_128_bit() {
        let carrier = reader(&[
            ("x-b3-traceid", "1234567890abcdef00000000000000ff"),
            ("x-b3-spanid", "0000000000000001"),
        ]);
        let out = extract_multi(&carrier).unwrap();
        assert_eq!(out.trace_id.upper, 0x1234_5678_90ab_cdef);
        assert_eq!(out.trace_id.lower, 0xff);
        assert_eq!(out.priority, None);
    }

    #[test]
    fn test_extract_single() {
        let carrier = reader(&[("b3", "00000000000000ff-0000000000000001-0")]);
        let out = extract_single(&carrier).unwrap();
        assert_eq!(out.trace_id.lower, 0xff);
        assert_eq!(out.span_id, 1);
        assert_eq!(out.priority, Some(0.0));
    }

    #[test]
    fn test_extract_single_deny_only() {
        let carrier = reader(&[("b3", "0")]);
        assert!(matches!(
            extract_single(&carrier),
            Err(PropagationError::NotFound)
        ));
    }

    #[test]
    fn test_corrupted_ids() {
        let carrier = reader(&[
            ("x-b3-traceid", "zzz"),
            ("x-b3-spanid", "0000000000000001"),
        ]);
        assert!(matches!(
            extract_multi(&carrier),
            Err(PropagationError::Corrupted)
        ));
    }
}
