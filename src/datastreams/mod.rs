//! Data-streams pipeline stats
//!
//! Checkpoints along a data pathway produce latency points keyed by
//! their pipeline hash. Points merge within time-aligned buckets; a
//! flusher ships elapsed buckets to the agent as a gzipped protobuf.
//!
//! # Module Structure
//!
//! * `hash` - murmur3 node/pipeline hashing

/// Murmur3 node and pipeline hashing
pub mod hash;

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use prost::Message;

use crate::stats::sketch::DDSketch;
use crate::util::{RateLimitedLog, StopLatch};
use crate::writer::transport::Transport;

const BUCKET_DURATION_NS: u64 = 10_000_000_000;
const INGEST_CAPACITY: usize = 10_000;
const LANG: &str = "rust";
const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");

static DROP_LOG: RateLimitedLog = RateLimitedLog::new(60);

#[inline]
fn align(ts: u64) -> u64 {
    ts - (ts % BUCKET_DURATION_NS)
}

/// One data-streams checkpoint summary.
#[derive(Debug, Clone)]
pub struct StatsPoint {
    pub service: String,
    pub edge: String,
    pub parent_hash: u64,
    pub pipeline_hash: u64,
    pub timestamp_ns: u64,
    pub latency: DDSketch,
}

impl StatsPoint {
    /// Convenience constructor for a single-latency checkpoint.
    pub fn with_latency(
        service: &str,
        edge: &str,
        parent_hash: u64,
        timestamp_ns: u64,
        latency_ns: f64,
    ) -> StatsPoint {
        let node = hash::node_hash(service, edge);
        StatsPoint {
            service: service.to_string(),
            edge: edge.to_string(),
            parent_hash,
            pipeline_hash: hash::pipeline_hash(node, parent_hash),
            timestamp_ns,
            latency: DDSketch::single(latency_ns),
        }
    }
}

struct Aggregate {
    service: String,
    edge: String,
    parent_hash: u64,
    timestamp_ns: u64,
    latency: DDSketch,
}

type Buckets = BTreeMap<u64, HashMap<u64, Aggregate>>;

enum Event {
    Point(Box<StatsPoint>),
    Stop,
}

/// The pipeline-stats concentrator: bounded ingest channel, bucketed
/// sketch merging, periodic protobuf flush.
pub(crate) struct PipelineConcentrator {
    tx: SyncSender<Event>,
    ingest_handle: Mutex<Option<JoinHandle<()>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<StopLatch>,
}

struct FlushContext {
    transport: Arc<dyn Transport>,
    env: String,
    service: String,
}

impl PipelineConcentrator {
    pub fn start(
        transport: Arc<dyn Transport>,
        env: String,
        service: String,
    ) -> PipelineConcentrator {
        let (tx, rx) = mpsc::sync_channel(INGEST_CAPACITY);
        let buckets: Arc<Mutex<Buckets>> = Arc::new(Mutex::new(BTreeMap::new()));
        let stop = Arc::new(StopLatch::new());

        let ingest_buckets = buckets.clone();
        let ingest_handle = Builder::new()
            .name("meridian-pipeline-ingest".to_string())
            .spawn(move || ingest_loop(rx, ingest_buckets))
            .expect("failed to spawn pipeline stats ingester thread");

        let ctx = FlushContext {
            transport,
            env,
            service,
        };
        let flush_stop = stop.clone();
        let flush_handle = Builder::new()
            .name("meridian-pipeline-flush".to_string())
            .spawn(move || flush_loop(ctx, buckets, flush_stop))
            .expect("failed to spawn pipeline stats flusher thread");

        PipelineConcentrator {
            tx,
            ingest_handle: Mutex::new(Some(ingest_handle)),
            flush_handle: Mutex::new(Some(flush_handle)),
            stop,
        }
    }

    /// Non-blocking submission; a full channel drops the point.
    pub fn submit(&self, point: StatsPoint) {
        match self.tx.try_send(Event::Point(Box::new(point))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                crate::warn_limited!(DROP_LOG, "pipeline stats queue full, dropping point");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Event::Stop);
        if let Some(handle) = self.ingest_handle.lock().take() {
            let _ = handle.join();
        }
        self.stop.trigger();
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn ingest_loop(rx: Receiver<Event>, buckets: Arc<Mutex<Buckets>>) {
    while let Ok(event) = rx.recv() {
        match event {
            Event::Point(point) => {
                let mut buckets = buckets.lock();
                let bucket = buckets.entry(align(point.timestamp_ns)).or_default();
                match bucket.get_mut(&point.pipeline_hash) {
                    Some(aggregate) => aggregate.latency.merge_with(&point.latency),
                    None => {
                        bucket.insert(
                            point.pipeline_hash,
                            Aggregate {
                                service: point.service,
                                edge: point.edge,
                                parent_hash: point.parent_hash,
                                timestamp_ns: point.timestamp_ns,
                                latency: point.latency,
                            },
                        );
                    }
                }
            }
            Event::Stop => return,
        }
    }
}

fn flush_loop(ctx: FlushContext, buckets: Arc<Mutex<Buckets>>, stop: Arc<StopLatch>) {
    loop {
        let stopped = stop.wait_timeout(Duration::from_nanos(BUCKET_DURATION_NS));
        let now = crate::trace::id::now_nanos().max(0) as u64;
        let drained: Vec<(u64, HashMap<u64, Aggregate>)> = {
            let mut buckets = buckets.lock();
            let ready: Vec<u64> = buckets
                .keys()
                .copied()
                .filter(|start| stopped || start + BUCKET_DURATION_NS < now)
                .collect();
            ready
                .into_iter()
                .filter_map(|start| buckets.remove(&start).map(|b| (start, b)))
                .collect()
        };
        if !drained.is_empty() {
            flush_buckets(&ctx, drained);
        }
        if stopped {
            return;
        }
    }
}

fn flush_buckets(ctx: &FlushContext, drained: Vec<(u64, HashMap<u64, Aggregate>)>) {
    let payload = PbStatsPayload {
        env: ctx.env.clone(),
        service: ctx.service.clone(),
        stats: drained
            .into_iter()
            .map(|(start, points)| PbStatsBucket {
                start,
                duration: BUCKET_DURATION_NS,
                stats: points
                    .into_iter()
                    .map(|(pipeline_hash, aggregate)| PbStatsPoint {
                        service: aggregate.service,
                        edge: aggregate.edge,
                        parent_hash: aggregate.parent_hash,
                        pipeline_hash,
                        timestamp: aggregate.timestamp_ns,
                        latency: aggregate.latency.to_proto_bytes(),
                    })
                    .collect(),
            })
            .collect(),
        lang: LANG.to_string(),
        tracer_version: TRACER_VERSION.to_string(),
    };

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&payload.encode_to_vec()).is_err() {
        log::warn!("failed to compress pipeline stats payload");
        return;
    }
    let body = match encoder.finish() {
        Ok(body) => body,
        Err(e) => {
            log::warn!("failed to compress pipeline stats payload: {}", e);
            return;
        }
    };
    if let Err(e) = ctx.transport.send_pipeline_stats(&body) {
        log::warn!("failed to flush pipeline stats: {}", e);
    }
}

#[derive(Clone, PartialEq, Message)]
struct PbStatsPayload {
    #[prost(string, tag = "1")]
    env: String,
    #[prost(string, tag = "2")]
    service: String,
    #[prost(message, repeated, tag = "3")]
    stats: Vec<PbStatsBucket>,
    #[prost(string, tag = "4")]
    lang: String,
    #[prost(string, tag = "5")]
    tracer_version: String,
}

#[derive(Clone, PartialEq, Message)]
struct PbStatsBucket {
    #[prost(uint64, tag = "1")]
    start: u64,
    #[prost(uint64, tag = "2")]
    duration: u64,
    #[prost(message, repeated, tag = "3")]
    stats: Vec<PbStatsPoint>,
}

#[derive(Clone, PartialEq, Message)]
struct PbStatsPoint {
    #[prost(string, tag = "1")]
    service: String,
    #[prost(string, tag = "2")]
    edge: String,
    #[prost(uint64, tag = "3")]
    parent_hash: u64,
    #[prost(uint64, tag = "4")]
    pipeline_hash: u64,
    #[prost(uint64, tag = "5")]
    timestamp: u64,
    #[prost(bytes = "vec", tag = "6")]
    latency: Vec<u8>,
}
