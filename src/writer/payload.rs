//! Trace payload accumulation
//!
//! Chunks are serialized into a rolling MessagePack buffer as they
//! arrive; the writer flushes the buffer as one body when it grows past
//! the size threshold or the flush tick fires. Two wire generations are
//! supported: v0.4 (arrays of span maps) and v0.5 (string-interned
//! dual array).

use std::collections::HashMap;

use derive_more::{Display, Error};
use serde_json::json;

use crate::trace::buffer::Chunk;
use crate::trace::span::{AttributeValue, SpanEvent, SpanLink, SpanState};
use crate::writer::transport::ApiVersion;

#[derive(Debug, Display, Error)]
pub enum EncodeError {
    #[display(fmt = "msgpack encoding failed")]
    Msgpack,
}

type Result<T> = std::result::Result<T, EncodeError>;

/// Optional wire features gated by agent capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    pub native_span_links: bool,
    pub native_span_events: bool,
}

fn put_array(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_array_len(buf, len)
        .map(|_| ())
        .map_err(|_| EncodeError::Msgpack)
}

fn put_map(buf: &mut Vec<u8>, len: u32) -> Result<()> {
    rmp::encode::write_map_len(buf, len)
        .map(|_| ())
        .map_err(|_| EncodeError::Msgpack)
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    rmp::encode::write_str(buf, s).map_err(|_| EncodeError::Msgpack)
}

fn put_uint(buf: &mut Vec<u8>, v: u64) -> Result<()> {
    rmp::encode::write_uint(buf, v)
        .map(|_| ())
        .map_err(|_| EncodeError::Msgpack)
}

fn put_sint(buf: &mut Vec<u8>, v: i64) -> Result<()> {
    rmp::encode::write_sint(buf, v)
        .map(|_| ())
        .map_err(|_| EncodeError::Msgpack)
}

fn put_f64(buf: &mut Vec<u8>, v: f64) -> Result<()> {
    rmp::encode::write_f64(buf, v).map_err(|_| EncodeError::Msgpack)
}

fn put_bool(buf: &mut Vec<u8>, v: bool) -> Result<()> {
    rmp::encode::write_bool(buf, v).map_err(|_| EncodeError::Msgpack)
}

/// Incrementally built v0.5 string table. Index 0 is the empty string.
struct StringTable {
    indexes: HashMap<String, u32>,
    list: Vec<String>,
}

impl StringTable {
    fn new() -> StringTable {
        let mut table = StringTable {
            indexes: HashMap::new(),
            list: Vec::new(),
        };
        table.intern("");
        table
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.indexes.get(s) {
            return *idx;
        }
        let idx = self.list.len() as u32;
        self.list.push(s.to_string());
        self.indexes.insert(s.to_string(), idx);
        idx
    }

    fn byte_size(&self) -> usize {
        self.list.iter().map(|s| s.len() + 5).sum()
    }
}

/// The rolling payload buffer owned by the writer thread.
pub(crate) struct Payload {
    version: ApiVersion,
    opts: EncodeOptions,
    buf: Vec<u8>,
    count: usize,
    strings: StringTable,
}

impl Payload {
    pub fn new(version: ApiVersion, opts: EncodeOptions) -> Payload {
        Payload {
            version,
            opts,
            buf: Vec::new(),
            count: 0,
            strings: StringTable::new(),
        }
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn chunk_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Estimated size of the body this payload would flush to.
    pub fn size(&self) -> usize {
        self.buf.len()
            + match self.version {
                ApiVersion::V04 => 8,
                ApiVersion::V05 => self.strings.byte_size() + 16,
            }
    }

    pub fn push_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        put_array(&mut self.buf, chunk.spans.len() as u32)?;
        for span in &chunk.spans {
            let trace_id_lower = span.trace_id().lower;
            let span_id = span.span_id();
            let parent_id = span.parent_id();
            span.with_state(|state| match self.version {
                ApiVersion::V04 => encode_span_v04(
                    &mut self.buf,
                    state,
                    trace_id_lower,
                    span_id,
                    parent_id,
                    self.opts,
                ),
                ApiVersion::V05 => encode_span_v05(
                    &mut self.buf,
                    &mut self.strings,
                    state,
                    trace_id_lower,
                    span_id,
                    parent_id,
                ),
            })?;
        }
        self.count += 1;
        Ok(())
    }

    /// Assemble the complete body and reset the accumulator.
    pub fn take_body(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size() + 16);
        match self.version {
            ApiVersion::V04 => {
                put_array(&mut out, self.count as u32)?;
                out.extend_from_slice(&self.buf);
            }
            ApiVersion::V05 => {
                put_array(&mut out, 2)?;
                put_array(&mut out, self.strings.list.len() as u32)?;
                for s in &self.strings.list {
                    put_str(&mut out, s)?;
                }
                put_array(&mut out, self.count as u32)?;
                out.extend_from_slice(&self.buf);
            }
        }
        self.buf.clear();
        self.count = 0;
        self.strings = StringTable::new();
        Ok(out)
    }
}

fn encode_span_v04(
    buf: &mut Vec<u8>,
    state: &SpanState,
    trace_id_lower: u64,
    span_id: u64,
    parent_id: u64,
    opts: EncodeOptions,
) -> Result<()> {
    let with_links = opts.native_span_links && !state.links.is_empty();
    let with_events = opts.native_span_events && !state.events.is_empty();

    // Non-native links and events fall back to JSON blobs in meta.
    let mut extra_meta: Vec<(&str, String)> = Vec::new();
    if !with_events && !state.events.is_empty() {
        extra_meta.push(("events", events_to_json(&state.events)));
    }
    if !with_links && !state.links.is_empty() {
        extra_meta.push(("_dd.span_links", links_to_json(&state.links)));
    }

    let mut fields = 12u32;
    if with_links {
        fields += 1;
    }
    if with_events {
        fields += 1;
    }
    put_map(buf, fields)?;

    put_str(buf, "service")?;
    put_str(buf, &state.service)?;
    put_str(buf, "name")?;
    put_str(buf, &state.operation)?;
    put_str(buf, "resource")?;
    put_str(buf, &state.resource)?;
    put_str(buf, "trace_id")?;
    put_uint(buf, trace_id_lower)?;
    put_str(buf, "span_id")?;
    put_uint(buf, span_id)?;
    put_str(buf, "parent_id")?;
    put_uint(buf, parent_id)?;
    put_str(buf, "start")?;
    put_sint(buf, state.start)?;
    put_str(buf, "duration")?;
    put_sint(buf, state.duration)?;
    put_str(buf, "error")?;
    put_sint(buf, state.error as i64)?;

    put_str(buf, "meta")?;
    put_map(buf, (state.meta.len() + extra_meta.len()) as u32)?;
    for (k, v) in &state.meta {
        put_str(buf, k)?;
        put_str(buf, v)?;
    }
    for (k, v) in &extra_meta {
        put_str(buf, k)?;
        put_str(buf, v)?;
    }

    put_str(buf, "metrics")?;
    put_map(buf, state.metrics.len() as u32)?;
    for (k, v) in &state.metrics {
        put_str(buf, k)?;
        put_f64(buf, *v)?;
    }

    put_str(buf, "type")?;
    put_str(buf, &state.span_type)?;

    if with_links {
        put_str(buf, "span_links")?;
        encode_links(buf, &state.links)?;
    }
    if with_events {
        put_str(buf, "span_events")?;
        encode_events(buf, &state.events)?;
    }
    Ok(())
}

fn encode_span_v05(
    buf: &mut Vec<u8>,
    strings: &mut StringTable,
    state: &SpanState,
    trace_id_lower: u64,
    span_id: u64,
    parent_id: u64,
) -> Result<()> {
    // The v0.5 span is a fixed 12-element array; links and events only
    // travel as JSON meta entries on this wire.
    let mut extra_meta: Vec<(u32, u32)> = Vec::new();
    if !state.events.is_empty() {
        let v = strings.intern(&events_to_json(&state.events));
        extra_meta.push((strings.intern("events"), v));
    }
    if !state.links.is_empty() {
        let v = strings.intern(&links_to_json(&state.links));
        extra_meta.push((strings.intern("_dd.span_links"), v));
    }

    put_array(buf, 12)?;
    let service = strings.intern(&state.service);
    put_uint(buf, service as u64)?;
    let name = strings.intern(&state.operation);
    put_uint(buf, name as u64)?;
    let resource = strings.intern(&state.resource);
    put_uint(buf, resource as u64)?;
    put_uint(buf, trace_id_lower)?;
    put_uint(buf, span_id)?;
    put_uint(buf, parent_id)?;
    put_sint(buf, state.start)?;
    put_sint(buf, state.duration)?;
    put_sint(buf, state.error as i64)?;

    put_map(buf, (state.meta.len() + extra_meta.len()) as u32)?;
    for (k, v) in &state.meta {
        let k = strings.intern(k);
        let v = strings.intern(v);
        put_uint(buf, k as u64)?;
        put_uint(buf, v as u64)?;
    }
    for (k, v) in &extra_meta {
        put_uint(buf, *k as u64)?;
        put_uint(buf, *v as u64)?;
    }

    put_map(buf, state.metrics.len() as u32)?;
    for (k, v) in &state.metrics {
        let k = strings.intern(k);
        put_uint(buf, k as u64)?;
        put_f64(buf, *v)?;
    }

    let span_type = strings.intern(&state.span_type);
    put_uint(buf, span_type as u64)?;
    Ok(())
}

fn encode_links(buf: &mut Vec<u8>, links: &[SpanLink]) -> Result<()> {
    put_array(buf, links.len() as u32)?;
    for link in links {
        let mut fields = 2u32;
        if link.trace_id.upper != 0 {
            fields += 1;
        }
        if !link.attributes.is_empty() {
            fields += 1;
        }
        if link.tracestate.is_some() {
            fields += 1;
        }
        if link.flags.is_some() {
            fields += 1;
        }
        put_map(buf, fields)?;
        put_str(buf, "trace_id")?;
        put_uint(buf, link.trace_id.lower)?;
        if link.trace_id.upper != 0 {
            put_str(buf, "trace_id_high")?;
            put_uint(buf, link.trace_id.upper)?;
        }
        put_str(buf, "span_id")?;
        put_uint(buf, link.span_id)?;
        if !link.attributes.is_empty() {
            put_str(buf, "attributes")?;
            put_map(buf, link.attributes.len() as u32)?;
            for (k, v) in &link.attributes {
                put_str(buf, k)?;
                put_str(buf, v)?;
            }
        }
        if let Some(ts) = &link.tracestate {
            put_str(buf, "tracestate")?;
            put_str(buf, ts)?;
        }
        if let Some(flags) = link.flags {
            put_str(buf, "flags")?;
            put_uint(buf, flags as u64)?;
        }
    }
    Ok(())
}

fn encode_events(buf: &mut Vec<u8>, events: &[SpanEvent]) -> Result<()> {
    put_array(buf, events.len() as u32)?;
    for event in events {
        put_map(buf, 3)?;
        put_str(buf, "name")?;
        put_str(buf, &event.name)?;
        put_str(buf, "time_unix_nano")?;
        put_uint(buf, event.time_unix_nano.max(0) as u64)?;
        put_str(buf, "attributes")?;
        put_map(buf, event.attributes.len() as u32)?;
        for (k, v) in &event.attributes {
            put_str(buf, k)?;
            encode_attribute(buf, v)?;
        }
    }
    Ok(())
}

fn encode_attribute(buf: &mut Vec<u8>, value: &AttributeValue) -> Result<()> {
    match value {
        AttributeValue::Str(v) => put_str(buf, v),
        AttributeValue::Bool(v) => put_bool(buf, *v),
        AttributeValue::Int(v) => put_sint(buf, *v),
        AttributeValue::Float(v) => put_f64(buf, *v),
        AttributeValue::StrArray(vs) => {
            put_array(buf, vs.len() as u32)?;
            for v in vs {
                put_str(buf, v)?;
            }
            Ok(())
        }
        AttributeValue::BoolArray(vs) => {
            put_array(buf, vs.len() as u32)?;
            for v in vs {
                put_bool(buf, *v)?;
            }
            Ok(())
        }
        AttributeValue::IntArray(vs) => {
            put_array(buf, vs.len() as u32)?;
            for v in vs {
                put_sint(buf, *v)?;
            }
            Ok(())
        }
        AttributeValue::FloatArray(vs) => {
            put_array(buf, vs.len() as u32)?;
            for v in vs {
                put_f64(buf, *v)?;
            }
            Ok(())
        }
    }
}

fn events_to_json(events: &[SpanEvent]) -> String {
    let arr: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            let attrs: serde_json::Map<String, serde_json::Value> = e
                .attributes
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect();
            json!({
                "name": e.name,
                "time_unix_nano": e.time_unix_nano,
                "attributes": attrs,
            })
        })
        .collect();
    serde_json::to_string(&arr).unwrap_or_default()
}

fn links_to_json(links: &[SpanLink]) -> String {
    let arr: Vec<serde_json::Value> = links
        .iter()
        .map(|l| {
            let mut obj = serde_json::Map::new();
            obj.insert("trace_id".to_string(), json!(l.trace_id.lower));
            if l.trace_id.upper != 0 {
                obj.insert("trace_id_high".to_string(), json!(l.trace_id.upper));
            }
            obj.insert("span_id".to_string(), json!(l.span_id));
            if !l.attributes.is_empty() {
                obj.insert("attributes".to_string(), json!(l.attributes));
            }
            if let Some(ts) = &l.tracestate {
                obj.insert("tracestate".to_string(), json!(ts));
            }
            if let Some(flags) = l.flags {
                obj.insert("flags".to_string(), json!(flags));
            }
            serde_json::Value::Object(obj)
        })
        .collect();
    serde_json::to_string(&arr).unwrap_or_default()
}
