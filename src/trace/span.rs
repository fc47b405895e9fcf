//! The span entity
//!
//! A `Span` is a cheaply clonable handle onto one timed unit of work.
//! Identity fields are fixed at start; names, tags, and timing live
//! behind the span's own lock until `finish` freezes them. Finish state
//! is tracked by an atomic outside the lock so buffer bookkeeping can
//! classify spans without touching their locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_derive::Serialize;

use crate::sampling;
use crate::trace::context::SpanContext;
use crate::trace::id::{MonotonicAnchor, TraceId};
use crate::trace::peer;

/// A typed tag value accepted by `set_tag`.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl From<&str> for TagValue {
    fn from(v: &str) -> TagValue {
        TagValue::Str(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> TagValue {
        TagValue::Str(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> TagValue {
        TagValue::Bool(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> TagValue {
        TagValue::Int(v)
    }
}

impl From<i32> for TagValue {
    fn from(v: i32) -> TagValue {
        TagValue::Int(v as i64)
    }
}

impl From<u32> for TagValue {
    fn from(v: u32) -> TagValue {
        TagValue::Int(v as i64)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> TagValue {
        TagValue::Float(v)
    }
}

/// A typed attribute on a span event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    StrArray(Vec<String>),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

/// A reference to a related span in this or another trace.
#[derive(Debug, Clone)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub tracestate: Option<String>,
    pub attributes: HashMap<String, String>,
    pub flags: Option<u32>,
}

/// A named, time-stamped record attached to a span.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: i64,
    pub attributes: Vec<(String, AttributeValue)>,
}

/// Mutable span fields, guarded by the span's lock.
pub(crate) struct SpanState {
    pub operation: String,
    pub service: String,
    pub resource: String,
    pub span_type: String,
    pub start: i64,
    pub duration: i64,
    pub error: i32,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
    pub links: Vec<SpanLink>,
    pub events: Vec<SpanEvent>,
    pub finished: bool,
}

struct SpanInner {
    span_id: u64,
    parent_id: u64,
    context: SpanContext,
    finished: AtomicBool,
    anchor: MonotonicAnchor,
    state: RwLock<SpanState>,
}

#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

/// Options accepted by `finish_with`.
#[derive(Debug, Default, Clone)]
pub struct FinishOptions {
    /// Explicit end time in nanoseconds since the epoch.
    pub finish_time_nanos: Option<i64>,
    /// Marks the span as errored with the given message.
    pub error: Option<String>,
}

impl Span {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_internal(
        context: SpanContext,
        parent_id: u64,
        operation: String,
        service: String,
        resource: String,
        span_type: String,
        anchor: MonotonicAnchor,
    ) -> Span {
        let span_id = context.span_id();
        Span {
            inner: Arc::new(SpanInner {
                span_id,
                parent_id,
                context,
                finished: AtomicBool::new(false),
                anchor,
                state: RwLock::new(SpanState {
                    operation,
                    service,
                    resource,
                    span_type,
                    start: anchor.start_nanos(),
                    duration: 0,
                    error: 0,
                    meta: HashMap::new(),
                    metrics: HashMap::new(),
                    links: Vec::new(),
                    events: Vec::new(),
                    finished: false,
                }),
            }),
        }
    }

    /// Like `new_internal` but reusing a pooled state shell. The shell
    /// arrives zeroed; only the live fields are filled in.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_from_shell(
        context: SpanContext,
        parent_id: u64,
        operation: String,
        service: String,
        resource: String,
        span_type: String,
        anchor: MonotonicAnchor,
        mut shell: SpanState,
    ) -> Span {
        let span_id = context.span_id();
        shell.operation = operation;
        shell.service = service;
        shell.resource = resource;
        shell.span_type = span_type;
        shell.start = anchor.start_nanos();
        Span {
            inner: Arc::new(SpanInner {
                span_id,
                parent_id,
                context,
                finished: AtomicBool::new(false),
                anchor,
                state: RwLock::new(shell),
            }),
        }
    }

    /// Recover the state shell when this is the last handle, for return
    /// to the span pool. The context is left on the dropped inner; the
    /// shell gets a fresh one when reused.
    pub(crate) fn try_reclaim(self) -> Option<SpanState> {
        Arc::try_unwrap(self.inner)
            .ok()
            .map(|inner| inner.state.into_inner())
    }

    pub fn context(&self) -> SpanContext {
        self.inner.context.clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.context.trace_id()
    }

    pub fn span_id(&self) -> u64 {
        self.inner.span_id
    }

    pub fn parent_id(&self) -> u64 {
        self.inner.parent_id
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Only the trace buffer calls this, under the trace lock.
    pub(crate) fn mark_finished(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    pub(crate) fn same_span(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&SpanState) -> R) -> R {
        f(&self.inner.state.read())
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut SpanState) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    pub fn operation(&self) -> String {
        self.with_state(|s| s.operation.clone())
    }

    pub fn service(&self) -> String {
        self.with_state(|s| s.service.clone())
    }

    pub fn resource(&self) -> String {
        self.with_state(|s| s.resource.clone())
    }

    pub fn start_nanos(&self) -> i64 {
        self.with_state(|s| s.start)
    }

    pub fn duration_nanos(&self) -> i64 {
        self.with_state(|s| s.duration)
    }

    /// Set a tag. String values land in `meta`, numeric values in
    /// `metrics`. A handful of reserved keys steer span fields and the
    /// trace's sampling verdict instead. Writes on a finished span are
    /// dropped with a diagnostic.
    pub fn set_tag<V: Into<TagValue>>(&self, key: &str, value: V) {
        let value = value.into();

        // Sampling controls talk to the trace handle; they must not run
        // under the span lock.
        match key {
            "manual.keep" => {
                if truthy(&value) {
                    self.inner.context.trace().set_sampling_priority(
                        sampling::USER_KEEP,
                        Some(sampling::MECHANISM_MANUAL),
                    );
                }
                return;
            }
            "manual.drop" => {
                if truthy(&value) {
                    self.inner
                        .context
                        .trace()
                        .set_sampling_priority(sampling::USER_REJECT, None);
                }
                return;
            }
            "sampling.priority" => {
                if let TagValue::Int(p) = value {
                    let mechanism = if p > 0 {
                        Some(sampling::MECHANISM_MANUAL)
                    } else {
                        None
                    };
                    self.inner
                        .context
                        .trace()
                        .set_sampling_priority(p as f64, mechanism);
                }
                return;
            }
            _ => {}
        }

        if self.is_finished() {
            log::debug!("dropping tag {:?} set on finished span", key);
            return;
        }

        self.with_state_mut(|state| {
            if state.finished {
                return;
            }
            match key {
                "operation.name" => {
                    if let TagValue::Str(v) = value {
                        state.operation = v;
                    }
                }
                "service.name" => {
                    if let TagValue::Str(v) = value {
                        state.service = v;
                    }
                }
                "resource.name" => {
                    if let TagValue::Str(v) = value {
                        state.resource = v;
                    }
                }
                "span.type" => {
                    if let TagValue::Str(v) = value {
                        state.span_type = v;
                    }
                }
                "error" => match value {
                    TagValue::Bool(b) => state.error = b as i32,
                    TagValue::Int(i) => state.error = (i != 0) as i32,
                    TagValue::Str(msg) => {
                        state.error = 1;
                        state.meta.insert("error.message".to_string(), msg);
                    }
                    TagValue::Float(f) => state.error = (f != 0.0) as i32,
                },
                _ => match value {
                    TagValue::Str(v) => {
                        state.meta.insert(key.to_string(), v);
                    }
                    TagValue::Bool(v) => {
                        state.meta.insert(key.to_string(), v.to_string());
                    }
                    TagValue::Int(v) => {
                        state.metrics.insert(key.to_string(), v as f64);
                    }
                    TagValue::Float(v) => {
                        state.metrics.insert(key.to_string(), v);
                    }
                },
            }
        });
    }

    pub fn set_operation_name(&self, name: &str) {
        self.set_tag("operation.name", name);
    }

    pub fn set_baggage_item(&self, key: &str, value: &str) {
        self.inner.context.set_baggage_item(key, value);
    }

    pub fn baggage_item(&self, key: &str) -> Option<String> {
        self.inner.context.baggage_item(key)
    }

    pub fn add_link(&self, link: SpanLink) {
        self.add_links(vec![link]);
    }

    pub fn add_links(&self, links: Vec<SpanLink>) {
        if self.is_finished() {
            log::debug!("dropping span links added to finished span");
            return;
        }
        self.with_state_mut(|state| state.links.extend(links));
    }

    /// Attach a named event stamped with the current time.
    pub fn add_event(&self, name: &str, attributes: Vec<(String, AttributeValue)>) {
        if self.is_finished() {
            log::debug!("dropping span event {:?} added to finished span", name);
            return;
        }
        let event = SpanEvent {
            name: name.to_string(),
            time_unix_nano: self.inner.anchor.now_nanos(),
            attributes,
        };
        self.with_state_mut(|state| state.events.push(event));
    }

    /// Record an error as an `exception` span event and flag the span.
    pub fn record_exception<E: std::error::Error>(&self, err: &E) {
        let attributes = vec![
            (
                "exception.type".to_string(),
                AttributeValue::Str(std::any::type_name::<E>().to_string()),
            ),
            (
                "exception.message".to_string(),
                AttributeValue::Str(err.to_string()),
            ),
        ];
        self.add_event("exception", attributes);
        if !self.is_finished() {
            self.with_state_mut(|state| {
                state.error = 1;
                state
                    .meta
                    .entry("error.message".to_string())
                    .or_insert_with(|| err.to_string());
                state
                    .meta
                    .entry("error.type".to_string())
                    .or_insert_with(|| std::any::type_name::<E>().to_string());
            });
        }
    }

    pub fn finish(&self) {
        self.finish_with(FinishOptions::default());
    }

    /// Finish the span. Idempotent; only the first call has any effect.
    pub fn finish_with(&self, opts: FinishOptions) {
        if self.is_finished() {
            return;
        }
        let trace = self.inner.context.trace().clone();
        let sink = trace.sink();

        // The post-processor may still mutate open fields, so it runs
        // before anything is frozen; a false verdict drops the trace.
        if let Some(sink) = &sink {
            if !sink.post_process(self) {
                trace.set_dropped();
            }
        }

        let mut state = self.inner.state.write();
        if state.finished {
            return;
        }
        state.finished = true;
        if let Some(msg) = opts.error {
            state.error = 1;
            state.meta.insert("error.message".to_string(), msg);
        }
        let end = opts
            .finish_time_nanos
            .unwrap_or_else(|| self.inner.anchor.now_nanos());
        state.duration = (end - state.start).max(0);

        if let Some(sink) = &sink {
            peer::process_finished_span(&sink.config(), &mut state);
            if trace.decision() == crate::sampling::SamplingDecision::Drop {
                sink.apply_span_sampling(self.inner.span_id, &mut state);
            }
        }

        // Lock order is span then trace: the span guard stays held
        // across the trace bookkeeping.
        trace.finished_one(self, &mut state);
        drop(state);

        if let Some(sink) = sink {
            sink.span_finished(self);
        }
    }
}

fn truthy(value: &TagValue) -> bool {
    match value {
        TagValue::Bool(b) => *b,
        TagValue::Int(i) => *i != 0,
        TagValue::Float(f) => *f != 0.0,
        TagValue::Str(s) => s == "true" || s == "1",
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Span")
            .field("operation", &state.operation)
            .field("service", &state.service)
            .field("trace_id", &self.trace_id())
            .field("span_id", &self.inner.span_id)
            .field("parent_id", &self.inner.parent_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trace::buffer::TraceBuffer;
    use std::collections::HashMap;

    /// Build a span attached to the given buffer without pushing it.
    pub(crate) fn make_span(
        buffer: &Arc<TraceBuffer>,
        trace_id: TraceId,
        span_id: u64,
        parent_id: u64,
    ) -> Span {
        let ctx = SpanContext::new_local(
            trace_id,
            span_id,
            None,
            None,
            HashMap::new(),
            buffer.clone(),
        );
        Span::new_internal(
            ctx,
            parent_id,
            "test.op".to_string(),
            "test-svc".to_string(),
            "test-resource".to_string(),
            String::new(),
            MonotonicAnchor::now(),
        )
    }

    fn detached_span() -> Span {
        make_span(&Arc::new(TraceBuffer::new_local()), TraceId::new(0, 1), 1, 0)
    }

    #[test]
    fn test_tag_routing() {
        let span = detached_span();
        span.set_tag("http.method", "GET");
        span.set_tag("http.status_code", 200);
        span.set_tag("retry", true);
        span.set_tag("elapsed_ratio", 0.5);
        span.with_state(|s| {
            assert_eq!(s.meta.get("http.method").map(String::as_str), Some("GET"));
            assert_eq!(s.meta.get("retry").map(String::as_str), Some("true"));
            assert_eq!(s.metrics.get("http.status_code"), Some(&200.0));
            assert_eq!(s.metrics.get("elapsed_ratio"), Some(&0.5));
        });
    }

    #[test]
    fn test_reserved_keys_update_fields() {
        let span = detached_span();
        span.set_tag("operation.name", "renamed");
        span.set_tag("resource.name", "SELECT 1");
        span.set_tag("span.type", "sql");
        span.set_tag("service.name", "db");
        assert_eq!(span.operation(), "renamed");
        assert_eq!(span.resource(), "SELECT 1");
        assert_eq!(span.service(), "db");
        span.with_state(|s| assert_eq!(s.span_type, "sql"));
    }

    #[test]
    fn test_error_tag_variants() {
        let span = detached_span();
        span.set_tag("error", true);
        span.with_state(|s| assert_eq!(s.error, 1));
        span.set_tag("error", false);
        span.with_state(|s| assert_eq!(s.error, 0));
        span.set_tag("error", "boom");
        span.with_state(|s| {
            assert_eq!(s.error, 1);
            assert_eq!(s.meta.get("error.message").map(String::as_str), Some("boom"));
        });
    }

    #[test]
    fn test_finish_idempotent() {
        let span = detached_span();
        span.finish();
        let first = span.duration_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        span.finish();
        assert_eq!(span.duration_nanos(), first);
    }

    #[test]
    fn test_tags_after_finish_dropped() {
        let span = detached_span();
        span.finish();
        span.set_tag("late", "value");
        span.with_state(|s| assert!(s.meta.get("late").is_none()));
    }

    #[test]
    fn test_zero_duration_clamped() {
        let span = detached_span();
        let start = span.start_nanos();
        span.finish_with(FinishOptions {
            finish_time_nanos: Some(start - 5),
            error: None,
        });
        assert_eq!(span.duration_nanos(), 0);
    }

    #[test]
    fn test_manual_keep_sets_user_priority() {
        let span = detached_span();
        span.set_tag("manual.keep", true);
        assert_eq!(
            span.context().sampling_priority(),
            Some(crate::sampling::USER_KEEP)
        );
    }

    #[test]
    fn test_record_exception() {
        let span = detached_span();
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        span.record_exception(&err);
        span.with_state(|s| {
            assert_eq!(s.error, 1);
            assert_eq!(s.events.len(), 1);
            assert_eq!(s.events[0].name, "exception");
            assert!(s
                .events[0]
                .attributes
                .iter()
                .any(|(k, v)| k == "exception.message"
                    && *v == AttributeValue::Str("disk on fire".to_string())));
        });
    }

    #[test]
    fn test_events_on_finished_span_dropped() {
        let span = detached_span();
        span.finish();
        span.add_event("late", Vec::new());
        span.with_state(|s| assert!(s.events.is_empty()));
    }
}
