//! Span and trace runtime
//!
//! This module owns the hot path of the tracer: span construction and
//! finish, the per-trace aggregation buffer, configuration, pooling,
//! and the tracer lifecycle itself.
//!
//! # Module Structure
//!
//! * `id` - trace/span identifier and time primitives
//! * `span` - the span entity and its tag surface
//! * `context` - propagatable span identity
//! * `buffer` - per-trace span buffer and chunk emission
//! * `config` - configuration resolution
//! * `pool` - optional span allocation pooling
//! * `peer` - peer.service derivation at finish
//! * `tracer` - the process-wide tracer

/// Per-trace span buffer and chunk emission
pub mod buffer;

/// Configuration resolution and option setters
pub mod config;

/// Propagatable span identity
pub mod context;

/// Trace and span identifier primitives
pub mod id;

/// Peer service derivation for outbound spans
pub(crate) mod peer;

/// Optional span allocation pooling
pub mod pool;

/// The span entity
pub mod span;

/// The process-wide tracer
pub mod tracer;

// Reserved metric and meta keys shared across the runtime.
pub(crate) const KEY_SAMPLING_PRIORITY: &str = "_sampling_priority_v1";
pub(crate) const KEY_DECISION_MAKER: &str = "_dd.p.dm";
pub(crate) const KEY_ORIGIN: &str = "_dd.origin";
pub(crate) const KEY_TOP_LEVEL: &str = "_dd.top_level";
pub(crate) const KEY_MEASURED: &str = "_dd.measured";
pub(crate) const KEY_BASE_SERVICE: &str = "_dd.base_service";
pub(crate) const KEY_TRACE_ID_UPPER: &str = "_dd.p.tid";
pub(crate) const KEY_PROPAGATION_ERROR: &str = "_dd.propagation_error";
pub(crate) const KEY_RULE_RATE: &str = "_dd.rule_psr";
pub(crate) const KEY_LIMIT_RATE: &str = "_dd.limit_psr";
pub(crate) const KEY_AGENT_RATE: &str = "_dd.agent_psr";
pub(crate) const KEY_SAMPLE_RATE: &str = "_sample_rate";
pub(crate) const KEY_SPAN_SAMPLING_MECHANISM: &str = "_dd.span_sampling.mechanism";
pub(crate) const KEY_SPAN_SAMPLING_RULE_RATE: &str = "_dd.span_sampling.rule_rate";
pub(crate) const KEY_SPAN_SAMPLING_MPS: &str = "_dd.span_sampling.max_per_second";
pub(crate) const PROPAGATING_TAG_PREFIX: &str = "_dd.p.";
