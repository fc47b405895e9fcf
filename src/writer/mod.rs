//! Trace writer pipeline
//!
//! A single background worker drains a bounded chunk queue into a
//! rolling payload and flushes it over HTTP on size, on a periodic
//! tick, on demand, and once more at shutdown. Producers never block:
//! when the queue is full the chunk is dropped and counted.
//!
//! # Module Structure
//!
//! * `payload` - MessagePack payload accumulation
//! * `transport` - HTTP transport with retry

/// MessagePack payload accumulation
pub mod payload;

/// HTTP transport towards the agent
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::agent::AgentFeatures;
use crate::sampling::priority::PrioritySampler;
use crate::trace::buffer::Chunk;
use crate::trace::pool;
use crate::util::RateLimitedLog;
use crate::writer::payload::{EncodeOptions, Payload};
use crate::writer::transport::{ApiVersion, Transport, TransportError};

/// Producer-to-worker queue bound; overflow is intentional back-pressure.
const QUEUE_CAPACITY: usize = 1000;

/// The agent rejects payloads beyond 9.5 MiB; flushing at half keeps a
/// comfortable margin for in-flight chunks.
const FLUSH_THRESHOLD: usize = 9_961_472 / 2;

static DROP_LOG: RateLimitedLog = RateLimitedLog::new(60);
static FLUSH_ERR_LOG: RateLimitedLog = RateLimitedLog::new(60);

enum Event {
    Chunk(Chunk),
    Flush(SyncSender<()>),
    Stop,
}

#[derive(Default)]
pub(crate) struct WriterMetrics {
    pub dropped_chunks: AtomicU64,
    pub dropped_p0_chunks: AtomicU64,
    pub flushed_traces: AtomicU64,
    pub flushed_payloads: AtomicU64,
    pub lost_traces: AtomicU64,
}

/// Handle owned by the tracer; the worker thread owns everything else.
pub(crate) struct TraceWriter {
    tx: SyncSender<Event>,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<WriterMetrics>,
}

impl TraceWriter {
    pub fn start(
        transport: Arc<dyn Transport>,
        features: Arc<AgentFeatures>,
        sampler: Arc<PrioritySampler>,
        flush_interval: Duration,
    ) -> TraceWriter {
        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let metrics = Arc::new(WriterMetrics::default());
        let worker = Worker {
            rx,
            transport,
            features,
            sampler,
            metrics: metrics.clone(),
            flush_interval,
        };
        let handle = Builder::new()
            .name("meridian-trace-writer".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn trace writer thread");
        TraceWriter {
            tx,
            handle: Mutex::new(Some(handle)),
            metrics,
        }
    }

    /// Non-blocking enqueue. A full queue drops the chunk and counts it.
    pub fn push_chunk(&self, chunk: Chunk) {
        match self.tx.try_send(Event::Chunk(chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                crate::warn_limited!(DROP_LOG, "trace writer queue full, dropping chunk");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Block until the worker has flushed everything queued so far.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.send(Event::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Drain, flush once more, and join the worker. Idempotent.
    pub fn stop(&self) {
        if self.tx.send(Event::Stop).is_err() {
            // Worker already gone.
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn metrics(&self) -> &WriterMetrics {
        &self.metrics
    }
}

struct Worker {
    rx: Receiver<Event>,
    transport: Arc<dyn Transport>,
    features: Arc<AgentFeatures>,
    sampler: Arc<PrioritySampler>,
    metrics: Arc<WriterMetrics>,
    flush_interval: Duration,
}

impl Worker {
    fn fresh_payload(&self) -> Payload {
        let version = if self.features.has_v05_traces() {
            ApiVersion::V05
        } else {
            ApiVersion::V04
        };
        let opts = EncodeOptions {
            native_span_links: self.features.is_discovered(),
            native_span_events: self.features.supports_span_events(),
        };
        Payload::new(version, opts)
    }

    fn run(self) {
        let mut payload = self.fresh_payload();
        let mut deadline = Instant::now() + self.flush_interval;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(Event::Chunk(chunk)) => {
                    self.serialize(&mut payload, chunk);
                    if payload.size() >= FLUSH_THRESHOLD {
                        self.flush_payload(&mut payload);
                        deadline = Instant::now() + self.flush_interval;
                    }
                }
                Ok(Event::Flush(ack)) => {
                    self.flush_payload(&mut payload);
                    deadline = Instant::now() + self.flush_interval;
                    let _ = ack.send(());
                }
                Ok(Event::Stop) => {
                    // Drain whatever producers managed to enqueue, then
                    // ship one final payload.
                    while let Ok(event) = self.rx.try_recv() {
                        match event {
                            Event::Chunk(chunk) => self.serialize(&mut payload, chunk),
                            Event::Flush(ack) => {
                                let _ = ack.send(());
                            }
                            Event::Stop => {}
                        }
                    }
                    self.flush_payload(&mut payload);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !payload.is_empty() {
                        self.flush_payload(&mut payload);
                    }
                    deadline = Instant::now() + self.flush_interval;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush_payload(&mut payload);
                    return;
                }
            }
        }
    }

    fn serialize(&self, payload: &mut Payload, mut chunk: Chunk) {
        if !chunk.will_send && self.features.client_drop_p0s() {
            // The agent has agreed to let rejected traces be dropped
            // client-side; individually sampled spans still travel.
            chunk.spans.retain(|span| {
                span.with_state(|state| {
                    state
                        .metrics
                        .contains_key(crate::trace::KEY_SPAN_SAMPLING_MECHANISM)
                })
            });
            if chunk.spans.is_empty() {
                self.metrics.dropped_p0_chunks.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = payload.push_chunk(&chunk) {
            self.metrics.lost_traces.fetch_add(1, Ordering::Relaxed);
            log::warn!("failed to serialize trace chunk: {}", e);
            return;
        }
        // The payload owns the bytes now; shells can go back to the
        // pool if nobody else holds the spans.
        let span_pool = pool::global();
        if span_pool.is_enabled() {
            for span in chunk.spans {
                if let Some(state) = span.try_reclaim() {
                    span_pool.release(state);
                }
            }
        }
    }

    fn flush_payload(&self, payload: &mut Payload) {
        if payload.is_empty() {
            return;
        }
        let count = payload.chunk_count();
        let version = payload.version();
        let body = match payload.take_body() {
            Ok(body) => body,
            Err(e) => {
                self.metrics
                    .lost_traces
                    .fetch_add(count as u64, Ordering::Relaxed);
                log::warn!("failed to assemble trace payload: {}", e);
                *payload = self.fresh_payload();
                return;
            }
        };
        match self.transport.send_traces(&body, count, version) {
            Ok(resp) => {
                self.metrics
                    .flushed_traces
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.metrics.flushed_payloads.fetch_add(1, Ordering::Relaxed);
                if let Some(rates) = resp.rate_by_service {
                    self.sampler.update_rates(rates);
                }
            }
            Err(TransportError::EndpointNotFound) if version == ApiVersion::V05 => {
                self.features.downgrade_traces();
                self.metrics
                    .lost_traces
                    .fetch_add(count as u64, Ordering::Relaxed);
                log::warn!("agent has no v0.5 traces endpoint, downgrading to v0.4");
            }
            Err(e) => {
                self.metrics
                    .lost_traces
                    .fetch_add(count as u64, Ordering::Relaxed);
                crate::warn_limited!(FLUSH_ERR_LOG, "failed to flush traces: {}", e);
            }
        }
        *payload = self.fresh_payload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::buffer::TraceBuffer;
    use crate::trace::id::TraceId;
    use crate::trace::span::tests::make_span;
    use crate::writer::transport::TraceResponse;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;

    struct RecordingTransport {
        bodies: PlMutex<Vec<(usize, ApiVersion)>>,
        rates: Option<HashMap<String, f64>>,
        fail_with_404: bool,
    }

    impl RecordingTransport {
        fn new() -> RecordingTransport {
            RecordingTransport {
                bodies: PlMutex::new(Vec::new()),
                rates: None,
                fail_with_404: false,
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send_traces(
            &self,
            _body: &[u8],
            count: usize,
            version: ApiVersion,
        ) -> Result<TraceResponse, TransportError> {
            if self.fail_with_404 {
                return Err(TransportError::EndpointNotFound);
            }
            self.bodies.lock().push((count, version));
            Ok(TraceResponse {
                rate_by_service: self.rates.clone(),
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

    fn chunk_of(n: u64) -> Chunk {
        let buffer = Arc::new(TraceBuffer::new_local());
        let spans = (1..=n)
            .map(|i| make_span(&buffer, TraceId::new(0, 9), i, if i == 1 { 0 } else { 1 }))
            .collect();
        Chunk {
            spans,
            will_send: true,
        }
    }

    fn start_writer(transport: Arc<RecordingTransport>) -> (TraceWriter, Arc<PrioritySampler>) {
        let sampler = Arc::new(PrioritySampler::new());
        let writer = TraceWriter::start(
            transport,
            Arc::new(AgentFeatures::unknown()),
            sampler.clone(),
            Duration::from_millis(50),
        );
        (writer, sampler)
    }

    #[test]
    fn test_explicit_flush_ships_queued_chunks() {
        let transport = Arc::new(RecordingTransport::new());
        let (writer, _) = start_writer(transport.clone());
        writer.push_chunk(chunk_of(2));
        writer.push_chunk(chunk_of(1));
        writer.flush();
        let bodies = transport.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0], (2, ApiVersion::V04));
        drop(bodies);
        writer.stop();
    }

    #[test]
    fn test_stop_drains_and_flushes() {
        let transport = Arc::new(RecordingTransport::new());
        let (writer, _) = start_writer(transport.clone());
        writer.push_chunk(chunk_of(1));
        writer.stop();
        assert_eq!(transport.bodies.lock().len(), 1);
        assert_eq!(writer.metrics().flushed_traces.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_rate_feedback_reaches_sampler() {
        let transport = Arc::new(RecordingTransport {
            bodies: PlMutex::new(Vec::new()),
            rates: Some(
                vec![("service:svc,env:prod".to_string(), 0.25)]
                    .into_iter()
                    .collect(),
            ),
            fail_with_404: false,
        });
        let (writer, sampler) = start_writer(transport);
        writer.push_chunk(chunk_of(1));
        writer.flush();
        assert_eq!(sampler.rate_for("svc", "prod"), 0.25);
        writer.stop();
    }

    #[test]
    fn test_404_counts_losses() {
        let transport = Arc::new(RecordingTransport {
            bodies: PlMutex::new(Vec::new()),
            rates: None,
            fail_with_404: true,
        });
        let (writer, _) = start_writer(transport);
        writer.push_chunk(chunk_of(1));
        writer.flush();
        assert_eq!(writer.metrics().lost_traces.load(Ordering::Relaxed), 1);
        writer.stop();
    }

    struct DropP0Transport;

    impl Transport for DropP0Transport {
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
            Ok(serde_json::json!({"client_drop_p0s": true}))
        }
    }

    #[test]
    fn test_rejected_chunks_dropped_when_agent_allows() {
        let features = Arc::new(AgentFeatures::unknown());
        features.discover(&DropP0Transport);
        assert!(features.client_drop_p0s());

        let recording = Arc::new(RecordingTransport::new());
        let writer = TraceWriter::start(
            recording.clone(),
            features,
            Arc::new(PrioritySampler::new()),
            Duration::from_secs(60),
        );

        let mut rejected = chunk_of(2);
        rejected.will_send = false;
        writer.push_chunk(rejected);

        // A single-span-sampled span survives the drop.
        let mut rescued = chunk_of(1);
        rescued.will_send = false;
        rescued.spans[0].set_tag(crate::trace::KEY_SPAN_SAMPLING_MECHANISM, 8.0);
        writer.push_chunk(rescued);

        writer.flush();
        let bodies = recording.bodies.lock();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, 1);
        drop(bodies);
        assert_eq!(
            writer.metrics().dropped_p0_chunks.load(Ordering::Relaxed),
            1
        );
        writer.stop();
    }

    struct GatedTransport {
        entered: mpsc::SyncSender<()>,
        release: PlMutex<mpsc::Receiver<()>>,
    }

    impl Transport for GatedTransport {
        fn send_traces(
            &self,
            _body: &[u8],
            _count: usize,
            _version: ApiVersion,
        ) -> Result<TraceResponse, TransportError> {
            let _ = self.entered.try_send(());
            let _ = self.release.lock().recv();
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

    #[test]
    fn test_full_queue_drops_chunks_without_blocking() {
        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::sync_channel::<()>(1);
        let transport = Arc::new(GatedTransport {
            entered: entered_tx,
            release: PlMutex::new(release_rx),
        });
        let sampler = Arc::new(PrioritySampler::new());
        let writer = TraceWriter::start(
            transport,
            Arc::new(AgentFeatures::unknown()),
            sampler,
            Duration::from_secs(60),
        );

        // Park the worker inside a flush so nothing drains the queue.
        writer.push_chunk(chunk_of(1));
        let flusher = {
            let tx = writer.tx.clone();
            std::thread::spawn(move || {
                let (ack_tx, ack_rx) = mpsc::sync_channel(1);
                let _ = tx.send(Event::Flush(ack_tx));
                let _ = ack_rx.recv();
            })
        };
        entered_rx.recv().unwrap();

        // The queue holds QUEUE_CAPACITY chunks; everything beyond must
        // be dropped without blocking this thread.
        for _ in 0..(QUEUE_CAPACITY + 10) {
            writer.push_chunk(chunk_of(1));
        }
        assert!(writer.metrics().dropped_chunks.load(Ordering::Relaxed) >= 10);

        release_tx.send(()).unwrap();
        flusher.join().unwrap();
        // Pre-arm the release for the final flush at stop.
        release_tx.send(()).unwrap();
        writer.stop();
    }

    #[test]
    fn test_tick_flush_without_traffic() {
        let transport = Arc::new(RecordingTransport::new());
        let (writer, _) = start_writer(transport.clone());
        writer.push_chunk(chunk_of(1));
        // Let at least one 50ms tick elapse.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(transport.bodies.lock().len(), 1);
        writer.stop();
    }
}
