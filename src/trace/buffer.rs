//! Per-trace span buffer
//!
//! Every trace owns one `TraceBuffer`: the ordered list of its spans,
//! the sampling verdict, and the tag bags that ride along with the
//! trace. Finishing spans drive chunk emission from here, either when
//! the whole trace completes or when the partial-flush threshold is
//! crossed. A hard span cap bounds memory for runaway traces.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::sampling::SamplingDecision;
use crate::trace::config::Config;
use crate::trace::span::{Span, SpanState};
use crate::trace::{KEY_DECISION_MAKER, KEY_SAMPLING_PRIORITY};

/// A contiguous batch of spans from one trace, delivered to the writer
/// atomically.
pub(crate) struct Chunk {
    pub spans: Vec<Span>,
    pub will_send: bool,
}

/// The tracer-side consumer of finished chunks. The buffer talks to the
/// rest of the runtime exclusively through this seam, which keeps the
/// finish path testable without a live writer.
pub(crate) trait ChunkSink: Send + Sync {
    fn accept_chunk(&self, chunk: Chunk);
    fn record_dropped_trace(&self);
    fn record_dropped_span(&self);
    /// Finished-span threshold for partial flushing, None when disabled.
    fn partial_flush_min(&self) -> Option<usize>;
    fn trace_max_size(&self) -> usize;
    fn config(&self) -> Arc<Config>;
    /// User post-processing at the start of finish; returning false
    /// drops the trace.
    fn post_process(&self, _span: &Span) -> bool {
        true
    }
    /// Single-span sampling for spans of dropped traces; runs with the
    /// finishing span's write guard held.
    fn apply_span_sampling(&self, _span_id: u64, _state: &mut SpanState) {}
    /// Called after a span fully finished, outside all locks.
    fn span_finished(&self, span: &Span);
}

struct TraceState {
    spans: Vec<Span>,
    finished: usize,
    full: bool,
    locked: bool,
    priority: Option<f64>,
    decision: SamplingDecision,
    propagating_tags: HashMap<String, String>,
    tags: HashMap<String, String>,
    root: Option<Span>,
    // Foreign-vendor tracestate entries preserved for reinjection.
    w3c_tracestate: Option<String>,
}

pub(crate) struct TraceBuffer {
    state: RwLock<TraceState>,
    sink: Mutex<Option<Arc<dyn ChunkSink>>>,
}

impl TraceBuffer {
    pub fn new_local() -> TraceBuffer {
        TraceBuffer {
            state: RwLock::new(TraceState {
                spans: Vec::new(),
                finished: 0,
                full: false,
                locked: false,
                priority: None,
                decision: SamplingDecision::None,
                propagating_tags: HashMap::new(),
                tags: HashMap::new(),
                root: None,
                w3c_tracestate: None,
            }),
            sink: Mutex::new(None),
        }
    }

    /// A handle seeded from extracted headers: it knows the upstream
    /// verdict and tag bag but holds no spans yet.
    pub fn new_extracted(
        priority: Option<f64>,
        decision: SamplingDecision,
        propagating_tags: HashMap<String, String>,
    ) -> TraceBuffer {
        TraceBuffer {
            state: RwLock::new(TraceState {
                spans: Vec::new(),
                finished: 0,
                full: false,
                locked: false,
                priority,
                decision,
                propagating_tags,
                tags: HashMap::new(),
                root: None,
                w3c_tracestate: None,
            }),
            sink: Mutex::new(None),
        }
    }

    pub fn sampling_priority(&self) -> Option<f64> {
        self.state.read().priority
    }

    pub fn decision(&self) -> SamplingDecision {
        self.state.read().decision
    }

    pub fn is_locked(&self) -> bool {
        self.state.read().locked
    }

    pub fn is_full(&self) -> bool {
        self.state.read().full
    }

    pub fn span_count(&self) -> usize {
        self.state.read().spans.len()
    }

    pub fn finished_count(&self) -> usize {
        self.state.read().finished
    }

    pub fn root(&self) -> Option<Span> {
        self.state.read().root.clone()
    }

    pub fn propagating_tags(&self) -> HashMap<String, String> {
        self.state.read().propagating_tags.clone()
    }

    pub fn propagating_tag(&self, key: &str) -> Option<String> {
        self.state.read().propagating_tags.get(key).cloned()
    }

    pub fn w3c_tracestate(&self) -> Option<String> {
        self.state.read().w3c_tracestate.clone()
    }

    pub fn set_w3c_tracestate(&self, tracestate: &str) {
        self.state.write().w3c_tracestate = Some(tracestate.to_string());
    }

    pub fn set_propagating_tag(&self, key: &str, value: &str) {
        self.state
            .write()
            .propagating_tags
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove_propagating_tag(&self, key: &str) {
        self.state.write().propagating_tags.remove(key);
    }

    /// Set a trace-level tag, stamped on the first span of every
    /// emitted chunk.
    pub fn set_trace_tag(&self, key: &str, value: &str) {
        self.state
            .write()
            .tags
            .insert(key.to_string(), value.to_string());
    }

    /// Record a sampling verdict. No-op once the trace is locked by a
    /// finished root. The decision maker tag is kept only for keeps.
    pub fn set_sampling_priority(&self, priority: f64, mechanism: Option<u32>) {
        let mut st = self.state.write();
        if st.locked {
            return;
        }
        st.priority = Some(priority);
        if priority > 0.0 {
            st.decision = SamplingDecision::Keep;
            if let Some(m) = mechanism {
                st.propagating_tags
                    .insert(KEY_DECISION_MAKER.to_string(), format!("-{}", m));
            }
        } else {
            st.decision = SamplingDecision::Drop;
            st.propagating_tags.remove(KEY_DECISION_MAKER);
        }
    }

    /// Mark the trace dropped without assigning a priority tier.
    pub fn set_dropped(&self) {
        let mut st = self.state.write();
        if st.locked {
            return;
        }
        st.decision = SamplingDecision::Drop;
        st.propagating_tags.remove(KEY_DECISION_MAKER);
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn ChunkSink>> {
        self.sink.lock().clone()
    }

    /// Append a started span. Installs the tracer sink on first use and
    /// enforces the trace span cap.
    pub(crate) fn push(&self, span: &Span, sink: &Arc<dyn ChunkSink>) {
        {
            let mut slot = self.sink.lock();
            if slot.is_none() {
                *slot = Some(sink.clone());
            }
        }
        let mut st = self.state.write();
        if st.full {
            sink.record_dropped_span();
            return;
        }
        if st.spans.len() + 1 >= sink.trace_max_size() {
            st.full = true;
            st.spans.clear();
            sink.record_dropped_trace();
            log::debug!("trace exceeded the span cap and was dropped");
            return;
        }
        // A span joining a trace whose verdict is already known carries
        // the priority metric from the start (inherited remote
        // priorities flow through here).
        if let Some(p) = st.priority {
            span.with_state_mut(|state| {
                state
                    .metrics
                    .insert(KEY_SAMPLING_PRIORITY.to_string(), p);
            });
        }
        if st.root.is_none() {
            st.root = Some(span.clone());
        }
        st.spans.push(span.clone());
    }

    /// Account one finished span and emit a chunk when the trace
    /// completes or crosses the partial-flush threshold.
    ///
    /// The caller holds the finishing span's write guard; all mutations
    /// of that span go through `span_state`, never through its lock.
    pub(crate) fn finished_one(&self, span: &Span, span_state: &mut SpanState) {
        let sink = self.sink();
        let mut st = self.state.write();
        // The wire-finished marker is only ever written here, under the
        // trace lock, so chunk classification below sees a consistent
        // view: concurrent finishers block on this lock first.
        span.mark_finished();
        let sink = match sink {
            Some(sink) => sink,
            None => return,
        };
        if st.full {
            return;
        }
        st.finished += 1;

        let is_root = st.root.as_ref().map_or(false, |r| r.same_span(span));
        if is_root {
            if let Some(p) = st.priority {
                span_state
                    .metrics
                    .insert(KEY_SAMPLING_PRIORITY.to_string(), p);
                st.locked = true;
            }
        }

        if st.finished == st.spans.len() {
            let spans = std::mem::replace(&mut st.spans, Vec::new());
            self.emit(&mut st, spans, span, span_state, &sink);
            return;
        }

        if let Some(min) = sink.partial_flush_min() {
            if st.finished >= min {
                let mut finished = Vec::with_capacity(st.finished);
                let mut leftover = Vec::new();
                for s in st.spans.drain(..) {
                    if s.is_finished() {
                        finished.push(s);
                    } else {
                        leftover.push(s);
                    }
                }
                st.spans = leftover;
                self.emit(&mut st, finished, span, span_state, &sink);
            }
        }
    }

    /// Stamp trace-level state on the chunk's first span and hand the
    /// chunk to the sink. Resets the finished counter.
    fn emit(
        &self,
        st: &mut TraceState,
        spans: Vec<Span>,
        finishing: &Span,
        finishing_state: &mut SpanState,
        sink: &Arc<dyn ChunkSink>,
    ) {
        st.finished = 0;
        if spans.is_empty() {
            return;
        }

        let priority = st.priority;
        let stamp = |state: &mut SpanState| {
            for (k, v) in st.tags.iter() {
                state.meta.insert(k.clone(), v.clone());
            }
            for (k, v) in st.propagating_tags.iter() {
                state.meta.insert(k.clone(), v.clone());
            }
            if let Some(p) = priority {
                state.metrics.insert(KEY_SAMPLING_PRIORITY.to_string(), p);
            }
        };
        if spans[0].same_span(finishing) {
            stamp(finishing_state);
        } else {
            spans[0].with_state_mut(stamp);
        }

        sink.accept_chunk(Chunk {
            spans,
            will_send: st.decision != SamplingDecision::Drop,
        });
    }
}
