//! W3C baggage propagation
//!
//! Baggage rides in its own header, independent of trace identity:
//! percent-encoded `key=value` pairs separated by commas.

use std::collections::HashMap;

use crate::propagation::carrier::{TextMapReader, TextMapWriter};
use crate::trace::context::SpanContext;

pub const HEADER_BAGGAGE: &str = "baggage";

/// W3C baggage caps.
const MAX_ITEMS: usize = 64;
const MAX_BYTES: usize = 8192;

fn needs_escape(c: char) -> bool {
    !(c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '*' | '\'' | '(' | ')' | '~' | '!' | '$' | '&' | '+'
        ))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        let c = b as char;
        if needs_escape(c) {
            out.push_str(&format!("%{:02X}", b));
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(b) = u8::from_str_radix(&String::from_utf8_lossy(hex), 16) {
                    out.push(b);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn inject(ctx: &SpanContext, carrier: &mut dyn TextMapWriter) {
    let mut out = String::new();
    let mut items = 0;
    ctx.for_each_baggage_item(|k, v| {
        if items >= MAX_ITEMS {
            return false;
        }
        let entry = format!("{}={}", percent_encode(k), percent_encode(v));
        if out.len() + entry.len() + 1 > MAX_BYTES {
            return false;
        }
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(&entry);
        items += 1;
        true
    });
    if !out.is_empty() {
        carrier.set(HEADER_BAGGAGE, &out);
    }
}

/// Parse the baggage header, if any. Never errors: malformed members
/// are skipped.
pub(crate) fn extract(reader: &dyn TextMapReader) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let raw = match reader.get(HEADER_BAGGAGE) {
        Some(raw) => raw,
        None => return out,
    };
    for member in raw.split(',') {
        // Properties after ';' are not retained.
        let member = member.split(';').next().unwrap_or("").trim();
        if member.is_empty() {
            continue;
        }
        if let Some(idx) = member.find('=') {
            let key = percent_decode(member[..idx].trim());
            let value = percent_decode(member[idx + 1..].trim());
            if !key.is_empty() {
                out.insert(key, value);
            }
        }
    }
    out
}
