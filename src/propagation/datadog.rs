//! Datadog-native header propagation

use std::collections::HashMap;

use crate::propagation::carrier::{TextMapReader, TextMapWriter};
use crate::propagation::{Extracted, PropagationError};
use crate::trace::context::SpanContext;
use crate::trace::id::{is_hex16, parse_hex64, TraceId};
use crate::trace::{KEY_TRACE_ID_UPPER, PROPAGATING_TAG_PREFIX};
use crate::util::RateLimitedLog;

pub const HEADER_TRACE_ID: &str = "x-datadog-trace-id";
pub const HEADER_PARENT_ID: &str = "x-datadog-parent-id";
pub const HEADER_PRIORITY: &str = "x-datadog-sampling-priority";
pub const HEADER_ORIGIN: &str = "x-datadog-origin";
pub const HEADER_TAGS: &str = "x-datadog-tags";
const BAGGAGE_PREFIX: &str = "ot-baggage-";

static TAGS_OVERFLOW_LOG: RateLimitedLog = RateLimitedLog::new(60);

pub(crate) fn inject(ctx: &SpanContext, carrier: &mut dyn TextMapWriter, max_tags_len: usize) {
    let trace_id = ctx.trace_id();
    carrier.set(HEADER_TRACE_ID, &trace_id.lower.to_string());
    carrier.set(HEADER_PARENT_ID, &ctx.span_id().to_string());
    if let Some(priority) = ctx.sampling_priority() {
        carrier.set(HEADER_PRIORITY, &(priority as i64).to_string());
    }
    if let Some(origin) = ctx.origin() {
        carrier.set(HEADER_ORIGIN, &origin);
    }

    let mut tags = ctx.propagating_tags();
    if trace_id.upper != 0 {
        tags.insert(KEY_TRACE_ID_UPPER.to_string(), trace_id.upper_hex16());
    } else {
        tags.remove(KEY_TRACE_ID_UPPER);
    }
    if let Some(bag) = serialize_tag_bag(&tags, max_tags_len) {
        if !bag.is_empty() {
            carrier.set(HEADER_TAGS, &bag);
        }
    } else {
        // The whole bag is dropped on overflow; downstream services see
        // the diagnostic on the local root instead.
        ctx.trace()
            .set_trace_tag(crate::trace::KEY_PROPAGATION_ERROR, "inject_max_size");
        crate::warn_limited!(
            TAGS_OVERFLOW_LOG,
            "propagating tags exceed {} bytes, dropping {}",
            max_tags_len,
            HEADER_TAGS
        );
    }

    ctx.for_each_baggage_item(|k, v| {
        carrier.set(&format!("{}{}", BAGGAGE_PREFIX, k), v);
        true
    });
}

/// Serialize the `k1=v1,k2=v2` tag bag, or None when it would exceed
/// the cap.
fn serialize_tag_bag(tags: &HashMap<String, String>, max_len: usize) -> Option<String> {
    let mut keys: Vec<&String> = tags
        .keys()
        .filter(|k| k.starts_with(PROPAGATING_TAG_PREFIX))
        .collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        let value = &tags[key];
        if !valid_tag_part(key) || !valid_tag_part(value) {
            continue;
        }
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    if out.len() > max_len {
        return None;
    }
    Some(out)
}

fn valid_tag_part(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c > ' ' && c <= '~' && c != ',' && c != '=')
}

pub(crate) fn extract(reader: &dyn TextMapReader) -> Result<Extracted, PropagationError> {
    let trace_raw = reader.get(HEADER_TRACE_ID);
    let parent_raw = reader.get(HEADER_PARENT_ID);
    if trace_raw.is_none() && parent_raw.is_none() {
        return Err(PropagationError::NotFound);
    }

    let lower = trace_raw
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(PropagationError::Corrupted)?;
    if lower == 0 {
        return Err(PropagationError::Corrupted);
    }
    let span_id = match parent_raw.as_deref() {
        Some(v) => v.parse::<u64>().map_err(|_| PropagationError::Corrupted)?,
        None => 0,
    };

    let mut extracted = Extracted::default();
    extracted.span_id = span_id;
    extracted.origin = reader.get(HEADER_ORIGIN);
    if let Some(raw) = reader.get(HEADER_PRIORITY) {
        let p = raw
            .parse::<i32>()
            .map_err(|_| PropagationError::Corrupted)?;
        extracted.priority = Some(p as f64);
    }

    let mut upper = 0u64;
    if let Some(bag) = reader.get(HEADER_TAGS) {
        for part in bag.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.find('=') {
                Some(idx) => (&part[..idx], &part[idx + 1..]),
                None => continue,
            };
            if !key.starts_with(PROPAGATING_TAG_PREFIX) {
                continue;
            }
            if key == KEY_TRACE_ID_UPPER {
                if is_hex16(value) {
                    upper = parse_hex64(value).unwrap_or(0);
                } else {
                    // Keep the ids we have; flag the bad upper half so
                    // it surfaces on the local root.
                    extracted.malformed_tid = true;
                }
                continue;
            }
            extracted
                .propagating_tags
                .insert(key.to_string(), value.to_string());
        }
    }
    extracted.trace_id = TraceId::new(upper, lower);

    reader.for_each(&mut |k, v| {
        let key = k.to_ascii_lowercase();
        if let Some(name) = key.strip_prefix(BAGGAGE_PREFIX) {
            extracted.baggage.insert(name.to_string(), v.to_string());
        }
        true
    });

    Ok(extracted)
}
