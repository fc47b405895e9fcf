//! Propagatable span identity
//!
//! A `SpanContext` is the portable part of a span: ids, origin, baggage,
//! and a reference to the trace's shared state. Contexts cross process
//! boundaries through the propagation codecs; within a process they are
//! cheap clones of one shared allocation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::sampling::SamplingDecision;
use crate::trace::buffer::TraceBuffer;
use crate::trace::id::TraceId;

#[derive(Clone)]
pub struct SpanContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    trace_id: TraceId,
    span_id: u64,
    origin: Option<String>,
    reparent_id: Option<String>,
    is_remote: bool,
    // Service of the hosting span, for in-process child inheritance.
    local_service: Option<String>,
    baggage: RwLock<HashMap<String, String>>,
    trace: Arc<TraceBuffer>,
}

impl SpanContext {
    pub(crate) fn new_local(
        trace_id: TraceId,
        span_id: u64,
        origin: Option<String>,
        local_service: Option<String>,
        baggage: HashMap<String, String>,
        trace: Arc<TraceBuffer>,
    ) -> SpanContext {
        SpanContext {
            inner: Arc::new(ContextInner {
                trace_id,
                span_id,
                origin,
                reparent_id: None,
                is_remote: false,
                local_service,
                baggage: RwLock::new(baggage),
                trace,
            }),
        }
    }

    /// Build a context from extracted headers. The context carries a
    /// detached trace handle holding the upstream priority and
    /// propagating tags until a local span joins the trace.
    pub fn new_extracted(
        trace_id: TraceId,
        span_id: u64,
        origin: Option<String>,
        priority: Option<f64>,
        baggage: HashMap<String, String>,
        propagating_tags: HashMap<String, String>,
        reparent_id: Option<String>,
    ) -> SpanContext {
        let decision = match priority {
            Some(p) if p > 0.0 => SamplingDecision::Keep,
            Some(_) => SamplingDecision::Drop,
            None => SamplingDecision::None,
        };
        let trace = Arc::new(TraceBuffer::new_extracted(
            priority,
            decision,
            propagating_tags,
        ));
        SpanContext {
            inner: Arc::new(ContextInner {
                trace_id,
                span_id,
                origin,
                reparent_id,
                is_remote: true,
                local_service: None,
                baggage: RwLock::new(baggage),
                trace,
            }),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.inner.span_id
    }

    pub fn origin(&self) -> Option<String> {
        self.inner.origin.clone()
    }

    /// 16-hex id of the upstream span this context was reparented from,
    /// recovered from a W3C tracestate `p` subkey.
    pub fn reparent_id(&self) -> Option<String> {
        self.inner.reparent_id.clone()
    }

    pub fn is_remote(&self) -> bool {
        self.inner.is_remote
    }

    pub(crate) fn local_service(&self) -> Option<String> {
        self.inner.local_service.clone()
    }

    pub fn sampling_priority(&self) -> Option<f64> {
        self.inner.trace.sampling_priority()
    }

    pub fn set_baggage_item(&self, key: &str, value: &str) {
        self.inner
            .baggage
            .write()
            .insert(key.to_string(), value.to_string());
    }

    pub fn baggage_item(&self, key: &str) -> Option<String> {
        self.inner.baggage.read().get(key).cloned()
    }

    /// Snapshot of the baggage map. Mutations after the call are not
    /// reflected in the returned map.
    pub fn baggage_snapshot(&self) -> HashMap<String, String> {
        self.inner.baggage.read().clone()
    }

    /// Visit baggage items until the visitor returns false.
    pub fn for_each_baggage_item<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        for (k, v) in self.inner.baggage.read().iter() {
            if !visit(k, v) {
                break;
            }
        }
    }

    pub(crate) fn trace(&self) -> &Arc<TraceBuffer> {
        &self.inner.trace
    }

    /// Snapshot of the trace's propagating tags (`_dd.p.*`).
    pub fn propagating_tags(&self) -> HashMap<String, String> {
        self.inner.trace.propagating_tags()
    }
}

impl std::fmt::Debug for SpanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanContext")
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("origin", &self.inner.origin)
            .field("is_remote", &self.inner.is_remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracted_context_carries_priority() {
        let ctx = SpanContext::new_extracted(
            TraceId::new(0, 7),
            9,
            Some("synthetics".to_string()),
            Some(2.0),
            HashMap::new(),
            HashMap::new(),
            None,
        );
        assert_eq!(ctx.sampling_priority(), Some(2.0));
        assert!(ctx.is_remote());
        assert_eq!(ctx.origin().as_deref(), Some("synthetics"));
    }

    #[test]
    fn test_baggage_snapshot_is_detached() {
        let ctx = SpanContext::new_extracted(
            TraceId::new(0, 1),
            1,
            None,
            None,
            HashMap::new(),
            HashMap::new(),
            None,
        );
        ctx.set_baggage_item("account", "42");
        let snap = ctx.baggage_snapshot();
        ctx.set_baggage_item("late", "x");
        assert_eq!(snap.len(), 1);
        assert_eq!(ctx.baggage_item("late").as_deref(), Some("x"));
    }
}
