//! Meridian Tracing Client
//!
//! The in-process core of a distributed-tracing client for the Datadog
//! agent protocol: span and trace lifecycle, sampling, buffered chunk
//! shipping over HTTP, client-side stats, data-streams latency
//! sketches, and trace-context propagation across process boundaries.
//!
//! # Features
//!
//! * Spans and traces with partial flushing and a hard memory cap
//! * Rate, rule, and agent-feedback sampling with dynamic reconfig
//! * Background trace writer with bounded-queue back-pressure
//! * MessagePack v0.4/v0.5 trace wire, chosen from agent discovery
//! * Datadog, W3C trace context, B3, and W3C baggage propagation
//! * Client-side span stats and data-streams pipeline stats
//!
//! # Architecture
//!
//! The crate is passive: it never intercepts I/O. Callers create spans
//! through the tracer, finish them, and the background subsystems ship
//! the results to the agent.
//!
//! ```rust,no_run
//! use meridian::{Config, StartSpanOptions};
//!
//! let _tracer = meridian::start(Config::from_env().with_service("billing"));
//! let span = meridian::start_span("web.request", StartSpanOptions::default());
//! span.set_tag("http.method", "GET");
//! span.finish();
//! meridian::stop();
//! ```

/// Agent feature discovery and polling
pub mod agent;

/// Data-streams pipeline stats
pub mod datastreams;

/// Context propagation across process boundaries
pub mod propagation;

/// Remote configuration application
pub mod remoteconfig;

/// Sampling engine
pub mod sampling;

/// Client-side span stats
pub mod stats;

/// Span and trace runtime
pub mod trace;

/// Trace writer pipeline
pub mod writer;

/// Internal utilities
mod util;

pub use crate::datastreams::StatsPoint;
pub use crate::propagation::carrier::{TextMapReader, TextMapWriter};
pub use crate::propagation::{PropagationError, PropagationStyle, Propagator};
pub use crate::remoteconfig::ApplyState;
pub use crate::sampling::rules::SamplingRule;
pub use crate::trace::config::Config;
pub use crate::trace::context::SpanContext;
pub use crate::trace::id::TraceId;
pub use crate::trace::span::{
    AttributeValue, FinishOptions, Span, SpanEvent, SpanLink, TagValue,
};
pub use crate::trace::tracer::{
    flush, global, start, start_span, stop, StartSpanOptions, Tracer,
};
