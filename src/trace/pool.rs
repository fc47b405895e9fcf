//! Span allocation pooling
//!
//! The pool recycles span state shells between traces to avoid
//! re-allocating the tag maps on every span. Released shells have all
//! serialized fields zeroed and their maps truncated in place, never
//! freed. Pooling is gated by a process-wide atomic and must not change
//! observable tracer semantics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::trace::span::SpanState;

const POOL_CAP: usize = 4096;

pub struct SpanPool {
    shells: Mutex<Vec<SpanState>>,
    enabled: AtomicBool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

lazy_static! {
    static ref GLOBAL_POOL: SpanPool = SpanPool::new();
}

/// The process-wide span pool.
pub fn global() -> &'static SpanPool {
    &GLOBAL_POOL
}

impl SpanPool {
    fn new() -> SpanPool {
        SpanPool {
            shells: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Take a cleared shell, or None when pooling is off or empty.
    pub(crate) fn acquire(&self) -> Option<SpanState> {
        if !self.is_enabled() {
            return None;
        }
        let shell = self.shells.lock().pop();
        match shell {
            Some(s) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(s)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a shell. Serialized fields are zeroed and maps cleared,
    /// keeping their capacity.
    pub(crate) fn release(&self, mut state: SpanState) {
        if !self.is_enabled() {
            return;
        }
        state.operation.clear();
        state.service.clear();
        state.resource.clear();
        state.span_type.clear();
        state.start = 0;
        state.duration = 0;
        state.error = 0;
        state.meta.clear();
        state.metrics.clear();
        state.links.clear();
        state.events.clear();
        state.finished = false;
        let mut shells = self.shells.lock();
        if shells.len() < POOL_CAP {
            shells.push(state);
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shells.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dirty_state() -> SpanState {
        let mut meta = HashMap::new();
        meta.insert("k".to_string(), "v".to_string());
        let mut metrics = HashMap::new();
        metrics.insert("m".to_string(), 1.0);
        SpanState {
            operation: "op".to_string(),
            service: "svc".to_string(),
            resource: "res".to_string(),
            span_type: "web".to_string(),
            start: 5,
            duration: 7,
            error: 1,
            meta,
            metrics,
            links: Vec::new(),
            events: Vec::new(),
            finished: true,
        }
    }

    #[test]
    fn test_disabled_pool_is_inert() {
        let pool = SpanPool::new();
        pool.release(dirty_state());
        assert_eq!(pool.len(), 0);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_release_zeroes_shell() {
        let pool = SpanPool::new();
        pool.set_enabled(true);
        pool.release(dirty_state());
        let shell = pool.acquire().expect("shell");
        assert!(shell.operation.is_empty());
        assert!(shell.meta.is_empty());
        assert!(shell.metrics.is_empty());
        assert_eq!(shell.start, 0);
        assert_eq!(shell.duration, 0);
        assert_eq!(shell.error, 0);
        assert!(!shell.finished);
    }
}
