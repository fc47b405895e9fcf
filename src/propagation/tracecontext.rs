//! W3C trace context propagation (`traceparent` / `tracestate`)

use crate::propagation::carrier::{TextMapReader, TextMapWriter};
use crate::propagation::{Extracted, PropagationError};
use crate::trace::context::SpanContext;
use crate::trace::id::{is_hex16, TraceId};
use crate::trace::{KEY_TRACE_ID_UPPER, PROPAGATING_TAG_PREFIX};

pub const HEADER_TRACEPARENT: &str = "traceparent";
pub const HEADER_TRACESTATE: &str = "tracestate";

/// tracestate caps from the W3C spec.
const MAX_TRACESTATE_ENTRIES: usize = 32;
const MAX_DD_MEMBER_LEN: usize = 256;

pub(crate) fn inject(ctx: &SpanContext, carrier: &mut dyn TextMapWriter) {
    let trace_id = ctx.trace_id();
    let priority = ctx.sampling_priority();
    let sampled = priority.map_or(false, |p| p > 0.0);
    carrier.set(
        HEADER_TRACEPARENT,
        &format!(
            "00-{}-{:016x}-{:02x}",
            trace_id.to_hex32(),
            ctx.span_id(),
            if sampled { 1 } else { 0 }
        ),
    );
    carrier.set(HEADER_TRACESTATE, &build_tracestate(ctx, priority));
}

fn build_tracestate(ctx: &SpanContext, priority: Option<f64>) -> String {
    let mut dd = String::new();
    if let Some(p) = priority {
        dd.push_str(&format!("s:{}", p as i64));
    }
    if let Some(origin) = ctx.origin() {
        if !dd.is_empty() {
            dd.push(';');
        }
        dd.push_str(&format!("o:{}", sanitize_value(&origin)));
    }
    if !dd.is_empty() {
        dd.push(';');
    }
    dd.push_str(&format!("p:{:016x}", ctx.span_id()));

    let mut tags: Vec<(String, String)> = ctx
        .propagating_tags()
        .into_iter()
        .filter(|(k, _)| k != KEY_TRACE_ID_UPPER)
        .collect();
    tags.sort();
    for (key, value) in tags {
        let sub = format!(
            ";t.{}:{}",
            key.trim_start_matches(PROPAGATING_TAG_PREFIX),
            sanitize_value(&value)
        );
        if dd.len() + sub.len() > MAX_DD_MEMBER_LEN {
            break;
        }
        dd.push_str(&sub);
    }

    let mut out = format!("dd={}", dd);
    if let Some(extra) = ctx.trace().w3c_tracestate() {
        let mut entries = 1;
        for member in extra.split(',') {
            let member = member.trim();
            if member.is_empty() || member.starts_with("dd=") {
                continue;
            }
            if entries >= MAX_TRACESTATE_ENTRIES {
                break;
            }
            out.push(',');
            out.push_str(member);
            entries += 1;
        }
    }
    out
}

// tracestate values may not contain `,`, `;`, `=` or `~`; `=` is
// carried as `~` and everything else invalid becomes `_`.
fn sanitize_value(v: &str) -> String {
    v.chars()
        .map(|c| match c {
            '=' => '~',
            c if c < ' ' || c > '~' || c == ',' || c == ';' || c == '~' => '_',
            c => c,
        })
        .collect()
}

fn unsanitize_value(v: &str) -> String {
    v.replace('~', "=")
}

pub(crate) fn extract(reader: &dyn TextMapReader) -> Result<Extracted, PropagationError> {
    let raw = reader
        .get(HEADER_TRACEPARENT)
        .ok_or(PropagationError::NotFound)?;
    let (trace_id, span_id, flags) = parse_traceparent(&raw)?;

    let mut extracted = Extracted::default();
    extracted.trace_id = trace_id;
    extracted.span_id = span_id;

    let sampled = flags & 1 == 1;
    let mut state_priority: Option<i32> = None;

    if let Some(state) = reader.get(HEADER_TRACESTATE) {
        let mut extra = Vec::new();
        for member in state.split(',') {
            let member = member.trim();
            if member.is_empty() {
                continue;
            }
            if let Some(dd) = member.strip_prefix("dd=") {
                parse_dd_member(dd, &mut extracted, &mut state_priority);
            } else {
                extra.push(member.to_string());
            }
        }
        if !extra.is_empty() {
            extracted.w3c_tracestate = Some(extra.join(","));
        }
    }

    // A `t.tid` subkey backs the upper id half; it never rides along
    // as an ordinary propagating tag.
    if let Some(tid) = extracted.propagating_tags.remove(KEY_TRACE_ID_UPPER) {
        if is_hex16(&tid) {
            if extracted.trace_id.upper == 0 {
                extracted.trace_id.upper =
                    crate::trace::id::parse_hex64(&tid).unwrap_or(0);
            }
        } else {
            extracted.malformed_tid = true;
        }
    }

    // Reconcile the tracestate priority with the sampled flag; the flag
    // wins when the two disagree.
    extracted.priority = Some(match state_priority {
        Some(p) if (p > 0) == sampled => p as f64,
        _ => {
            if sampled {
                1.0
            } else {
                0.0
            }
        }
    });

    Ok(extracted)
}

fn parse_dd_member(dd: &str, extracted: &mut Extracted, state_priority: &mut Option<i32>) {
    for sub in dd.split(';') {
        let (key, value) = match sub.find(':') {
            Some(idx) => (&sub[..idx], &sub[idx + 1..]),
            None => continue,
        };
        match key {
            "s" => {
                if let Ok(p) = value.parse::<i32>() {
                    *state_priority = Some(p);
                }
            }
            "o" => {
                extracted.origin = Some(unsanitize_value(value));
            }
            "p" => {
                if is_hex16(value) {
                    extracted.reparent_id = Some(value.to_lowercase());
                }
            }
            _ => {
                if let Some(tag) = key.strip_prefix("t.") {
                    extracted.propagating_tags.insert(
                        format!("{}{}", PROPAGATING_TAG_PREFIX, tag),
                        unsanitize_value(value),
                    );
                }
            }
        }
    }
}

fn parse_traceparent(raw: &str) -> Result<(TraceId, u64, u8), PropagationError> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split('-').collect();
    if parts.len() < 4 {
        return Err(PropagationError::Corrupted);
    }
    let version = parts[0];
    if version.len() != 2
        || !version.chars().all(|c| c.is_ascii_hexdigit())
        || version.eq_ignore_ascii_case("ff")
    {
        return Err(PropagationError::Corrupted);
    }
    // Version 00 has exactly four fields.
    if version == "00" && parts.len() != 4 {
        return Err(PropagationError::Corrupted);
    }
    let trace_id = TraceId::from_hex32(&parts[1].to_lowercase())
        .ok_or(PropagationError::Corrupted)?;
    if trace_id.is_zero() {
        return Err(PropagationError::Corrupted);
    }
    if parts[2].len() != 16 || !parts[2].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PropagationError::Corrupted);
    }
    let span_id =
        u64::from_str_radix(parts[2], 16).map_err(|_| PropagationError::Corrupted)?;
    if span_id == 0 {
        return Err(PropagationError::Corrupted);
    }
    if parts[3].len() != 2 || !parts[3].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PropagationError::Corrupted);
    }
    let flags = u8::from_str_radix(parts[3], 16).map_err(|_| PropagationError::Corrupted)?;
    Ok((trace_id, span_id, flags))
}
