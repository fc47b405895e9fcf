//! The process-wide tracer
//!
//! The tracer owns every background subsystem, hands spans their trace
//! buffers, and routes finished chunks into the writer. One instance is
//! installed as the process-wide singleton via `start`; all span
//! creation flows through it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};

use crate::agent::{self, AgentFeatures};
use crate::datastreams::{PipelineConcentrator, StatsPoint};
use crate::propagation::carrier::{TextMapReader, TextMapWriter};
use crate::propagation::{PropagationError, Propagator};
use crate::remoteconfig::{HeaderTag, RemoteConfigHandler};
use crate::sampling::dynamic::{DynamicConfig, Origin};
use crate::sampling::SamplerChain;
use crate::stats::{SpanConcentrator, SpanStat};
use crate::trace::buffer::{Chunk, ChunkSink, TraceBuffer};
use crate::trace::config::Config;
use crate::trace::context::SpanContext;
use crate::trace::id::{random_span_id, MonotonicAnchor, TraceId};
use crate::trace::pool;
use crate::trace::span::{Span, SpanState, TagValue};
use crate::trace::{KEY_MEASURED, KEY_ORIGIN, KEY_TOP_LEVEL, KEY_TRACE_ID_UPPER};
use crate::util::StopLatch;
use crate::writer::transport::{ApiVersion, HttpTransport, TraceResponse, Transport, TransportError};
use crate::writer::TraceWriter;

lazy_static! {
    static ref GLOBAL_TRACER: RwLock<Option<Arc<Tracer>>> = RwLock::new(None);
}

/// Options for `start_span`.
#[derive(Default, Clone)]
pub struct StartSpanOptions {
    parent: Option<SpanContext>,
    start_time_nanos: Option<i64>,
    service: Option<String>,
    resource: Option<String>,
    span_type: Option<String>,
    tags: Vec<(String, TagValue)>,
}

impl StartSpanOptions {
    pub fn child_of(mut self, parent: SpanContext) -> StartSpanOptions {
        self.parent = Some(parent);
        self
    }

    pub fn with_start_time(mut self, nanos: i64) -> StartSpanOptions {
        self.start_time_nanos = Some(nanos);
        self
    }

    pub fn with_service<S: Into<String>>(mut self, service: S) -> StartSpanOptions {
        self.service = Some(service.into());
        self
    }

    pub fn with_resource<S: Into<String>>(mut self, resource: S) -> StartSpanOptions {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_span_type<S: Into<String>>(mut self, span_type: S) -> StartSpanOptions {
        self.span_type = Some(span_type.into());
        self
    }

    pub fn with_tag<V: Into<TagValue>>(mut self, key: &str, value: V) -> StartSpanOptions {
        self.tags.push((key.to_string(), value.into()));
        self
    }
}

type PostProcessor = Box<dyn Fn(&Span) -> bool + Send + Sync>;

struct TracerShared {
    cfg: Arc<Config>,
    chain: SamplerChain,
    features: Arc<AgentFeatures>,
    writer: Arc<TraceWriter>,
    stats: Option<Arc<SpanConcentrator>>,
    post_processor: Option<PostProcessor>,
    dropped_traces: AtomicU64,
    dropped_spans: AtomicU64,
    finished_spans: AtomicU64,
    swallowed_panics: AtomicU64,
}

impl ChunkSink for TracerShared {
    fn accept_chunk(&self, chunk: Chunk) {
        // Runs with the finishing span's guard and the trace lock held,
        // so no span state is read here; the writer worker does the
        // client-side p0 filtering.
        self.writer.push_chunk(chunk);
    }

    fn record_dropped_trace(&self) {
        self.dropped_traces.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped_span(&self) {
        self.dropped_spans.fetch_add(1, Ordering::Relaxed);
    }

    fn partial_flush_min(&self) -> Option<usize> {
        if self.cfg.partial_flush_enabled {
            Some(self.cfg.partial_flush_min_spans)
        } else {
            None
        }
    }

    fn trace_max_size(&self) -> usize {
        self.cfg.trace_max_size
    }

    fn config(&self) -> Arc<Config> {
        self.cfg.clone()
    }

    fn post_process(&self, span: &Span) -> bool {
        match &self.post_processor {
            Some(processor) => {
                match catch_unwind(AssertUnwindSafe(|| processor(span))) {
                    Ok(keep) => keep,
                    Err(_) => {
                        // A panicking processor must not take the span
                        // operation down with it.
                        self.swallowed_panics.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                }
            }
            None => true,
        }
    }

    fn apply_span_sampling(&self, span_id: u64, state: &mut SpanState) {
        self.chain.apply_span_sampling(span_id, state);
    }

    fn span_finished(&self, span: &Span) {
        self.finished_spans.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = &self.stats {
            if should_compute_stats(span) {
                stats.submit(snapshot_stat(span, &self.features.peer_tags()));
            }
        }
    }
}

/// The tracer instance. Create via `Tracer::new` (or the process-wide
/// `start`), shut down via `stop`.
pub struct Tracer {
    shared: Arc<TracerShared>,
    pipeline: Option<Arc<PipelineConcentrator>>,
    remote_config: RemoteConfigHandler,
    poller: Mutex<Option<JoinHandle<()>>>,
    stop_latch: Arc<StopLatch>,
    stopped: AtomicBool,
}

impl Tracer {
    pub fn new(cfg: Config) -> Arc<Tracer> {
        Tracer::build(cfg, None, None)
    }

    /// A tracer whose post-processor sees every span at finish and may
    /// veto its trace.
    pub fn with_post_processor<F>(cfg: Config, processor: F) -> Arc<Tracer>
    where
        F: Fn(&Span) -> bool + Send + Sync + 'static,
    {
        Tracer::build(cfg, Some(Box::new(processor)), None)
    }

    #[cfg(test)]
    pub(crate) fn new_with_transport(cfg: Config, transport: Arc<dyn Transport>) -> Arc<Tracer> {
        Tracer::build(cfg, None, Some(transport))
    }

    fn build(
        mut cfg: Config,
        post_processor: Option<PostProcessor>,
        transport_override: Option<Arc<dyn Transport>>,
    ) -> Arc<Tracer> {
        if cfg.service.is_empty() {
            cfg.service = default_service_name();
        }
        let cfg = Arc::new(cfg);

        let transport: Arc<dyn Transport> = match transport_override {
            Some(t) => t,
            None => {
                let agent_url = cfg.resolved_agent_url();
                match HttpTransport::new(&agent_url, cfg.agent_timeout) {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        log::warn!(
                            "cannot reach agent at {}: {}; traces will be discarded",
                            agent_url,
                            e
                        );
                        Arc::new(NoopTransport)
                    }
                }
            }
        };

        let features = Arc::new(AgentFeatures::unknown());
        let rate_origin = if cfg.sample_rate.is_some() {
            Origin::EnvVar
        } else {
            Origin::Default
        };
        let rate_cell = Arc::new(DynamicConfig::new(cfg.sample_rate, rate_origin));
        let header_tags_cell: Arc<DynamicConfig<Vec<HeaderTag>>> =
            Arc::new(DynamicConfig::new(Vec::new(), Origin::Default));
        let chain = SamplerChain::new(&cfg, rate_cell.clone());

        let writer = Arc::new(TraceWriter::start(
            transport.clone(),
            features.clone(),
            chain.priority.clone(),
            cfg.flush_interval,
        ));

        let stats = if cfg.stats_computation_enabled {
            Some(Arc::new(SpanConcentrator::start(
                transport.clone(),
                features.clone(),
                cfg.hostname.clone().unwrap_or_default(),
                cfg.env.clone().unwrap_or_default(),
                cfg.version.clone().unwrap_or_default(),
            )))
        } else {
            None
        };
        let pipeline = if cfg.data_streams_enabled {
            Some(Arc::new(PipelineConcentrator::start(
                transport.clone(),
                cfg.env.clone().unwrap_or_default(),
                cfg.service.clone(),
            )))
        } else {
            None
        };

        pool::global().set_enabled(cfg.span_pool_enabled);

        let stop_latch = Arc::new(StopLatch::new());
        let poller = agent::start_poller(features.clone(), transport, stop_latch.clone());

        if cfg.log_startup {
            log_startup(&cfg);
        }

        let shared = Arc::new(TracerShared {
            cfg,
            chain,
            features,
            writer,
            stats,
            post_processor,
            dropped_traces: AtomicU64::new(0),
            dropped_spans: AtomicU64::new(0),
            finished_spans: AtomicU64::new(0),
            swallowed_panics: AtomicU64::new(0),
        });

        Arc::new(Tracer {
            shared,
            pipeline,
            remote_config: RemoteConfigHandler::new(rate_cell, header_tags_cell),
            poller: Mutex::new(Some(poller)),
            stop_latch,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.cfg
    }

    /// Start a span. Never fails; an undecided trace runs the sampler
    /// chain before the span is returned.
    pub fn start_span(&self, operation: &str, opts: StartSpanOptions) -> Span {
        let anchor = match opts.start_time_nanos {
            Some(start) => MonotonicAnchor::with_start(start),
            None => MonotonicAnchor::now(),
        };
        let span_id = random_span_id();
        let cfg = &self.shared.cfg;

        // A parent with no trace identity (a baggage-only context)
        // still contributes its items to the fresh trace.
        let parent = opts.parent.as_ref();
        let linked_parent = parent.filter(|p| !p.trace_id().is_zero());

        let (trace_id, parent_id, origin, baggage, buffer, parent_service, parent_remote) =
            match linked_parent {
                Some(parent) => (
                    parent.trace_id(),
                    parent.span_id(),
                    parent.origin(),
                    parent.baggage_snapshot(),
                    parent.trace().clone(),
                    parent.local_service(),
                    parent.is_remote(),
                ),
                None => {
                    let trace_id =
                        TraceId::generate(span_id, anchor.start_nanos(), cfg.wide_trace_ids);
                    let buffer = Arc::new(TraceBuffer::new_local());
                    if trace_id.upper != 0 {
                        buffer.set_propagating_tag(KEY_TRACE_ID_UPPER, &trace_id.upper_hex16());
                    }
                    let baggage = parent
                        .map(|p| p.baggage_snapshot())
                        .unwrap_or_default();
                    (trace_id, 0, None, baggage, buffer, None, false)
                }
            };

        let service = opts
            .service
            .clone()
            .or_else(|| parent_service.clone())
            .unwrap_or_else(|| cfg.service.clone());
        let resource = opts.resource.clone().unwrap_or_else(|| operation.to_string());
        let span_type = opts.span_type.clone().unwrap_or_default();

        let context = SpanContext::new_local(
            trace_id,
            span_id,
            origin.clone(),
            Some(service.clone()),
            baggage,
            buffer.clone(),
        );

        let span = match pool::global().acquire() {
            Some(shell) => Span::new_from_shell(
                context,
                parent_id,
                operation.to_string(),
                service.clone(),
                resource,
                span_type,
                anchor,
                shell,
            ),
            None => Span::new_internal(
                context,
                parent_id,
                operation.to_string(),
                service.clone(),
                resource,
                span_type,
                anchor,
            ),
        };

        let sink: Arc<dyn ChunkSink> = self.shared.clone();
        buffer.push(&span, &sink);

        span.with_state_mut(|state| {
            if let Some(env) = &cfg.env {
                state.meta.insert("env".to_string(), env.clone());
            }
            if let Some(version) = &cfg.version {
                if service.eq_ignore_ascii_case(&cfg.service) {
                    state.meta.insert("version".to_string(), version.clone());
                }
            }
            for (k, v) in &cfg.global_tags {
                state.meta.insert(k.clone(), v.clone());
            }
            if let Some(origin) = &origin {
                state.meta.insert(KEY_ORIGIN.to_string(), origin.clone());
            }
            if parent_remote {
                if let Some(reparent) = linked_parent.and_then(|p| p.reparent_id()) {
                    state.meta.insert("_dd.parent_id".to_string(), reparent);
                }
            }
            let top_level = match linked_parent {
                None => true,
                Some(_) if parent_remote => true,
                Some(_) => parent_service
                    .as_deref()
                    .map_or(true, |ps| !ps.eq_ignore_ascii_case(&service)),
            };
            if top_level {
                state.metrics.insert(KEY_TOP_LEVEL.to_string(), 1.0);
            }
        });

        for (key, value) in opts.tags {
            span.set_tag(&key, value);
        }

        if buffer.sampling_priority().is_none() {
            self.shared.chain.sample(&span);
        }

        span
    }

    pub fn inject(
        &self,
        ctx: &SpanContext,
        carrier: &mut dyn TextMapWriter,
    ) -> Result<(), PropagationError> {
        Propagator::from_config(&self.shared.cfg).inject(ctx, carrier)
    }

    pub fn extract(&self, reader: &dyn TextMapReader) -> Result<SpanContext, PropagationError> {
        Propagator::from_config(&self.shared.cfg).extract(reader)
    }

    /// Blocking flush of everything buffered in the writer.
    pub fn flush(&self) {
        self.shared.writer.flush();
    }

    /// Feed one data-streams checkpoint; a no-op unless data streams
    /// are enabled.
    pub fn submit_pipeline_point(&self, point: StatsPoint) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.submit(point);
        }
    }

    /// Apply a remote-config update for the APM_TRACING product.
    pub fn apply_remote_config(&self, path: &str, raw: &[u8]) -> crate::remoteconfig::ApplyState {
        self.remote_config.handle_update(path, raw)
    }

    pub fn remove_remote_config(&self, path: &str) -> crate::remoteconfig::ApplyState {
        self.remote_config.handle_remove(path)
    }

    /// Shut down all workers, flushing buffered data. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_latch.trigger();
        if let Some(handle) = self.poller.lock().take() {
            let _ = handle.join();
        }
        self.shared.writer.stop();
        if let Some(stats) = &self.shared.stats {
            stats.stop();
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.stop();
        }
        log::debug!(
            "tracer stopped: {} spans finished, {} traces dropped",
            self.shared.finished_spans.load(Ordering::Relaxed),
            self.shared.dropped_traces.load(Ordering::Relaxed)
        );
    }

    #[cfg(test)]
    pub(crate) fn dropped_traces(&self) -> u64 {
        self.shared.dropped_traces.load(Ordering::Relaxed)
    }
}

fn default_service_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unnamed-rust-service".to_string())
}

fn log_startup(cfg: &Config) {
    let summary = serde_json::json!({
        "service": cfg.service,
        "env": cfg.env,
        "version": cfg.version,
        "agent_url": cfg.agent_url,
        "sample_rate": cfg.sample_rate,
        "sampling_rules": cfg.sampling_rules.len(),
        "partial_flush": cfg.partial_flush_enabled,
        "stats_computation": cfg.stats_computation_enabled,
        "data_streams": cfg.data_streams_enabled,
        "span_pool": cfg.span_pool_enabled,
        "trace_ids_128bit": cfg.wide_trace_ids,
        "debug": cfg.debug,
    });
    log::info!("tracer configuration: {}", summary);
}

fn should_compute_stats(span: &Span) -> bool {
    span.with_state(|s| {
        s.metrics.get(KEY_TOP_LEVEL) == Some(&1.0)
            || s.metrics.get(KEY_MEASURED) == Some(&1.0)
            || s.metrics.contains_key("_dd.compute_stats")
    })
}

fn snapshot_stat(span: &Span, peer_tag_keys: &[String]) -> SpanStat {
    let origin = span.context().origin();
    span.with_state(|s| {
        let http_status = s
            .meta
            .get("http.status_code")
            .and_then(|v| v.parse::<u32>().ok())
            .or_else(|| s.metrics.get("http.status_code").map(|v| *v as u32))
            .unwrap_or(0);
        let peer_tags = peer_tag_keys
            .iter()
            .filter_map(|key| s.meta.get(key).map(|v| format!("{}:{}", key, v)))
            .collect();
        SpanStat {
            service: s.service.clone(),
            name: s.operation.clone(),
            resource: s.resource.clone(),
            span_type: s.span_type.clone(),
            http_status,
            synthetics: origin
                .as_deref()
                .map_or(false, |o| o.starts_with("synthetics")),
            peer_tags,
            end_ns: (s.start + s.duration).max(0) as u64,
            duration_ns: s.duration,
            error: s.error != 0,
            top_level: s.metrics.get(KEY_TOP_LEVEL) == Some(&1.0),
        }
    })
}

/// Transport used when the agent URL cannot be parsed; everything sent
/// through it is acknowledged and discarded.
struct NoopTransport;

impl Transport for NoopTransport {
    fn send_traces(
        &self,
        _body: &[u8],
        _count: usize,
        _version: ApiVersion,
    ) -> Result<TraceResponse, TransportError> {
        Ok(TraceResponse {
            rate_by_service: None,
        })
    }

    fn send_stats(&self, _body: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_pipeline_stats(&self, _body: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn fetch_info(&self) -> Result<serde_json::Value, TransportError> {
        Ok(serde_json::json!({}))
    }
}

/// Install a tracer as the process-wide singleton, stopping any
/// previous one.
pub fn start(cfg: Config) -> Arc<Tracer> {
    let tracer = Tracer::new(cfg);
    install(tracer.clone());
    tracer
}

pub(crate) fn install(tracer: Arc<Tracer>) {
    let previous = GLOBAL_TRACER.write().replace(tracer);
    if let Some(previous) = previous {
        previous.stop();
    }
}

/// Stop and uninstall the process-wide tracer. Idempotent.
pub fn stop() {
    let tracer = GLOBAL_TRACER.write().take();
    if let Some(tracer) = tracer {
        tracer.stop();
    }
}

pub fn global() -> Option<Arc<Tracer>> {
    GLOBAL_TRACER.read().clone()
}

/// Blocking flush on the process-wide tracer, if one is installed.
pub fn flush() {
    if let Some(tracer) = global() {
        tracer.flush();
    }
}

/// Start a span on the process-wide tracer. Without one installed the
/// span is detached: usable, but never shipped.
pub fn start_span(operation: &str, opts: StartSpanOptions) -> Span {
    match global() {
        Some(tracer) => tracer.start_span(operation, opts),
        None => detached_span(operation, opts),
    }
}

fn detached_span(operation: &str, opts: StartSpanOptions) -> Span {
    let anchor = match opts.start_time_nanos {
        Some(start) => MonotonicAnchor::with_start(start),
        None => MonotonicAnchor::now(),
    };
    let span_id = random_span_id();
    let context = SpanContext::new_local(
        TraceId::generate(span_id, anchor.start_nanos(), false),
        span_id,
        None,
        None,
        HashMap::new(),
        Arc::new(TraceBuffer::new_local()),
    );
    Span::new_internal(
        context,
        0,
        operation.to_string(),
        opts.service.unwrap_or_default(),
        opts.resource.unwrap_or_else(|| operation.to_string()),
        opts.span_type.unwrap_or_default(),
        anchor,
    )
}
