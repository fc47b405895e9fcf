//! Client-side span stats
//!
//! Eligible finished spans are folded into time-aligned buckets keyed
//! by their aggregation attributes; a flusher ships every bucket whose
//! window has fully elapsed. The current bucket is never flushed early,
//! so late spans within the window still merge.
//!
//! # Module Structure
//!
//! * `sketch` - DDSketch quantile summaries
//! * `obfuscate` - resource masking for aggregation keys

/// Resource masking for aggregation keys
pub mod obfuscate;

/// DDSketch quantile summaries
pub mod sketch;

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::agent::AgentFeatures;
use crate::stats::obfuscate::obfuscate_resource;
use crate::stats::sketch::DDSketch;
use crate::util::{RateLimitedLog, StopLatch};
use crate::writer::transport::Transport;

const BUCKET_DURATION_NS: u64 = 10_000_000_000;
const INGEST_CAPACITY: usize = 10_000;
const LANG: &str = "rust";
const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");

static DROP_LOG: RateLimitedLog = RateLimitedLog::new(60);

/// Align a timestamp on the start of its bucket.
#[inline]
fn align(ts: u64) -> u64 {
    ts - (ts % BUCKET_DURATION_NS)
}

/// Snapshot of one finished span, taken on the caller thread.
#[derive(Debug, Clone)]
pub(crate) struct SpanStat {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub span_type: String,
    pub http_status: u32,
    pub synthetics: bool,
    pub peer_tags: Vec<String>,
    pub end_ns: u64,
    pub duration_ns: i64,
    pub error: bool,
    pub top_level: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    service: String,
    name: String,
    resource: String,
    span_type: String,
    http_status: u32,
    synthetics: bool,
    peer_tags: Vec<String>,
}

struct GroupStats {
    hits: u64,
    errors: u64,
    top_level_hits: u64,
    duration_sum: u64,
    ok_summary: DDSketch,
    error_summary: DDSketch,
}

impl GroupStats {
    fn new() -> GroupStats {
        GroupStats {
            hits: 0,
            errors: 0,
            top_level_hits: 0,
            duration_sum: 0,
            ok_summary: DDSketch::new(),
            error_summary: DDSketch::new(),
        }
    }

    fn record(&mut self, stat: &SpanStat) {
        self.hits += 1;
        self.duration_sum += stat.duration_ns.max(0) as u64;
        if stat.top_level {
            self.top_level_hits += 1;
        }
        if stat.error {
            self.errors += 1;
            self.error_summary.add(stat.duration_ns.max(0) as f64);
        } else {
            self.ok_summary.add(stat.duration_ns.max(0) as f64);
        }
    }
}

type Buckets = BTreeMap<u64, HashMap<GroupKey, GroupStats>>;

enum Event {
    Stat(Box<SpanStat>),
    Stop,
}

/// The span-stats concentrator: one ingester thread folding snapshots
/// into buckets, one flusher thread shipping elapsed buckets.
pub(crate) struct SpanConcentrator {
    tx: SyncSender<Event>,
    ingest_handle: Mutex<Option<JoinHandle<()>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<StopLatch>,
}

struct FlushContext {
    transport: Arc<dyn Transport>,
    hostname: String,
    env: String,
    version: String,
}

impl SpanConcentrator {
    pub fn start(
        transport: Arc<dyn Transport>,
        features: Arc<AgentFeatures>,
        hostname: String,
        env: String,
        version: String,
    ) -> SpanConcentrator {
        let (tx, rx) = mpsc::sync_channel(INGEST_CAPACITY);
        let buckets: Arc<Mutex<Buckets>> = Arc::new(Mutex::new(BTreeMap::new()));
        let stop = Arc::new(StopLatch::new());

        let ingest_buckets = buckets.clone();
        let ingest_features = features;
        let ingest_handle = Builder::new()
            .name("meridian-stats-ingest".to_string())
            .spawn(move || ingest_loop(rx, ingest_buckets, ingest_features))
            .expect("failed to spawn stats ingester thread");

        let ctx = FlushContext {
            transport,
            hostname,
            env,
            version,
        };
        let flush_buckets = buckets;
        let flush_stop = stop.clone();
        let flush_handle = Builder::new()
            .name("meridian-stats-flush".to_string())
            .spawn(move || flush_loop(ctx, flush_buckets, flush_stop))
            .expect("failed to spawn stats flusher thread");

        SpanConcentrator {
            tx,
            ingest_handle: Mutex::new(Some(ingest_handle)),
            flush_handle: Mutex::new(Some(flush_handle)),
            stop,
        }
    }

    /// Non-blocking submission from the finish path.
    pub fn submit(&self, stat: SpanStat) {
        match self.tx.try_send(Event::Stat(Box::new(stat))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                crate::warn_limited!(DROP_LOG, "span stats queue full, dropping point");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Stop both workers; every remaining bucket flushes on the way out.
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

fn ingest_loop(rx: Receiver<Event>, buckets: Arc<Mutex<Buckets>>, features: Arc<AgentFeatures>) {
    while let Ok(event) = rx.recv() {
        match event {
            Event::Stat(stat) => {
                let resource = obfuscate_resource(&stat.span_type, &stat.resource);
                let key = GroupKey {
                    service: stat.service.clone(),
                    name: stat.name.clone(),
                    resource,
                    span_type: stat.span_type.clone(),
                    http_status: stat.http_status,
                    synthetics: stat.synthetics,
                    peer_tags: if features.peer_tags().is_empty() {
                        Vec::new()
                    } else {
                        stat.peer_tags.clone()
                    },
                };
                let mut buckets = buckets.lock();
                let bucket = buckets.entry(align(stat.end_ns)).or_default();
                bucket.entry(key).or_insert_with(GroupStats::new).record(&stat);
            }
            Event::Stop => return,
        }
    }
}

fn flush_loop(ctx: FlushContext, buckets: Arc<Mutex<Buckets>>, stop: Arc<StopLatch>) {
    loop {
        let stopped = stop.wait_timeout(Duration::from_nanos(BUCKET_DURATION_NS));
        let now = crate::trace::id::now_nanos().max(0) as u64;
        let drained: Vec<(u64, HashMap<GroupKey, GroupStats>)> = {
            let mut buckets = buckets.lock();
            let cutoffs: Vec<u64> = buckets
                .keys()
                .copied()
                // Only buckets whose window fully elapsed, unless this
                // is the final flush.
                .filter(|start| stopped || start + BUCKET_DURATION_NS < now)
                .collect();
            cutoffs
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

fn flush_buckets(ctx: &FlushContext, drained: Vec<(u64, HashMap<GroupKey, GroupStats>)>) {
    let stats: Vec<StatsBucketPayload> = drained
        .into_iter()
        .map(|(start, groups)| StatsBucketPayload {
            start,
            duration: BUCKET_DURATION_NS,
            stats: groups
                .into_iter()
                .map(|(key, group)| GroupedStats {
                    service: key.service,
                    name: key.name,
                    resource: key.resource,
                    span_type: key.span_type,
                    http_status_code: key.http_status,
                    synthetics: key.synthetics,
                    peer_tags: key.peer_tags,
                    hits: group.hits,
                    errors: group.errors,
                    top_level_hits: group.top_level_hits,
                    duration: group.duration_sum,
                    ok_summary: ProtoBytes(group.ok_summary.to_proto_bytes()),
                    error_summary: ProtoBytes(group.error_summary.to_proto_bytes()),
                })
                .collect(),
        })
        .collect();

    let payload = StatsPayload {
        hostname: ctx.hostname.clone(),
        env: ctx.env.clone(),
        version: ctx.version.clone(),
        lang: LANG,
        tracer_version: TRACER_VERSION,
        stats,
    };
    let body = match rmp_serde::to_vec_named(&payload) {
        Ok(body) => body,
        Err(e) => {
            log::warn!("failed to encode stats payload: {}", e);
            return;
        }
    };
    if let Err(e) = ctx.transport.send_stats(&body) {
        log::warn!("failed to flush span stats: {}", e);
    }
}

/// Byte strings must hit the wire as msgpack bin, not int arrays.
struct ProtoBytes(Vec<u8>);

impl Serialize for ProtoBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

#[derive(Serialize)]
struct StatsPayload {
    #[serde(rename = "Hostname")]
    hostname: String,
    #[serde(rename = "Env")]
    env: String,
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Lang")]
    lang: &'static str,
    #[serde(rename = "TracerVersion")]
    tracer_version: &'static str,
    #[serde(rename = "Stats")]
    stats: Vec<StatsBucketPayload>,
}

#[derive(Serialize)]
struct StatsBucketPayload {
    #[serde(rename = "Start")]
    start: u64,
    #[serde(rename = "Duration")]
    duration: u64,
    #[serde(rename = "Stats")]
    stats: Vec<GroupedStats>,
}

#[derive(Serialize)]
struct GroupedStats {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Resource")]
    resource: String,
    #[serde(rename = "Type")]
    span_type: String,
    #[serde(rename = "HTTPStatusCode")]
    http_status_code: u32,
    #[serde(rename = "Synthetics")]
    synthetics: bool,
    #[serde(rename = "PeerTags")]
    peer_tags: Vec<String>,
    #[serde(rename = "Hits")]
    hits: u64,
    #[serde(rename = "Errors")]
    errors: u64,
    #[serde(rename = "TopLevelHits")]
    top_level_hits: u64,
    #[serde(rename = "Duration")]
    duration: u64,
    #[serde(rename = "OkSummary")]
    ok_summary: ProtoBytes,
    #[serde(rename = "ErrorSummary")]
    error_summary: ProtoBytes,
}
