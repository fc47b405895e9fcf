//! End-to-end tests against a local agent double

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use meridian::{Config, PropagationStyle, StartSpanOptions, Tracer};

#[derive(Debug, Clone)]
struct SeenRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

type Seen = Arc<Mutex<Vec<SeenRequest>>>;

/// A minimal HTTP/1.1 agent double on a random local port.
fn spawn_agent() -> (u16, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind agent double");
    let port = listener.local_addr().unwrap().port();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            let record = record.clone();
            thread::spawn(move || serve_connection(stream, record));
        }
    });
    (port, seen)
}

fn serve_connection(mut stream: TcpStream, record: Seen) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    loop {
        let request = match read_request(&mut stream) {
            Some(r) => r,
            None => return,
        };
        record.lock().unwrap().push(request);
        let body = br#"{"rate_by_service":{"service:quoted,env:prod":0.5}}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        if stream.write_all(response.as_bytes()).is_err() {
            return;
        }
        if stream.write_all(body).is_err() {
            return;
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Option<SeenRequest> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
        if head.len() > 65536 {
            return None;
        }
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some(idx) = line.find(':') {
            headers.insert(
                line[..idx].trim().to_lowercase(),
                line[idx + 1..].trim().to_string(),
            );
        }
    }
    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if length > 0 {
        stream.read_exact(&mut body).ok()?;
    }
    Some(SeenRequest {
        method,
        path,
        headers,
        body,
    })
}

fn agent_config(port: u16) -> Config {
    let mut cfg = Config::default()
        .with_service("quoted")
        .with_env("prod")
        .with_agent_url(format!("http://127.0.0.1:{}", port))
        .with_agent_timeout(Duration::from_secs(2));
    cfg.log_startup = false;
    cfg
}

#[test]
fn test_traces_reach_the_agent() {
    let (port, seen) = spawn_agent();
    let tracer = Tracer::new(agent_config(port));

    let root = tracer.start_span("web.request", StartSpanOptions::default());
    let child = tracer.start_span(
        "db.query",
        StartSpanOptions::default()
            .child_of(root.context())
            .with_resource("SELECT 1"),
    );
    child.finish();
    root.finish();
    tracer.flush();
    tracer.stop();

    let seen = seen.lock().unwrap();
    let trace_post = seen
        .iter()
        .find(|r| r.method == "POST" && r.path.ends_with("/traces"))
        .expect("no trace payload received");
    assert_eq!(trace_post.path, "/v0.4/traces");
    assert_eq!(
        trace_post
            .headers
            .get("x-datadog-trace-count")
            .map(String::as_str),
        Some("1")
    );
    assert_eq!(
        trace_post.headers.get("content-type").map(String::as_str),
        Some("application/msgpack")
    );
    assert_eq!(
        trace_post
            .headers
            .get("datadog-meta-lang")
            .map(String::as_str),
        Some("rust")
    );

    // One chunk of two spans, in start order.
    let decoded = rmpv::decode::read_value(&mut &trace_post.body[..]).unwrap();
    let traces = decoded.as_array().unwrap();
    assert_eq!(traces.len(), 1);
    let spans = traces[0].as_array().unwrap();
    assert_eq!(spans.len(), 2);
    let name_of = |span: &rmpv::Value| {
        span.as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_str() == Some("name"))
            .and_then(|(_, v)| v.as_str().map(String::from))
            .unwrap()
    };
    assert_eq!(name_of(&spans[0]), "web.request");
    assert_eq!(name_of(&spans[1]), "db.query");
}

#[test]
fn test_rate_feedback_applies_to_later_traces() {
    let (port, _seen) = spawn_agent();
    let tracer = Tracer::new(agent_config(port));

    let first = tracer.start_span("web.request", StartSpanOptions::default());
    first.finish();
    tracer.flush();

    // The flush response carried a 0.5 rate for (quoted, prod); fish
    // for a trace id that the feedback rate now rejects.
    let mut saw_reject = false;
    for _ in 0..64 {
        let span = tracer.start_span("web.request", StartSpanOptions::default());
        let priority = span.context().sampling_priority();
        span.finish();
        if priority == Some(0.0) {
            saw_reject = true;
            break;
        }
    }
    tracer.stop();
    assert!(saw_reject, "feedback rate 0.5 never rejected a trace");
}

#[test]
fn test_datadog_header_round_trip_through_child() {
    let (port, _seen) = spawn_agent();
    let tracer = Tracer::new(agent_config(port));

    let mut incoming: HashMap<String, String> = HashMap::new();
    incoming.insert("x-datadog-trace-id".to_string(), "1".to_string());
    incoming.insert("x-datadog-parent-id".to_string(), "1".to_string());
    incoming.insert("x-datadog-sampling-priority".to_string(), "1".to_string());
    incoming.insert(
        "x-datadog-tags".to_string(),
        "hello=world,_dd.p.dm=-4".to_string(),
    );

    let parent = tracer.extract(&incoming).expect("extract");
    let child = tracer.start_span("handler", StartSpanOptions::default().child_of(parent));

    let mut outgoing: HashMap<String, String> = HashMap::new();
    tracer
        .inject(&child.context(), &mut outgoing)
        .expect("inject");
    tracer.stop();

    assert_eq!(
        outgoing.get("x-datadog-trace-id").map(String::as_str),
        Some("1")
    );
    assert_eq!(
        outgoing.get("x-datadog-parent-id").cloned(),
        Some(child.span_id().to_string())
    );
    assert_eq!(
        outgoing
            .get("x-datadog-sampling-priority")
            .map(String::as_str),
        Some("1")
    );
    let tags = outgoing.get("x-datadog-tags").expect("tag bag");
    assert!(tags.contains("_dd.p.dm=-4"));
}

#[test]
fn test_w3c_reparenting_scenario() {
    let (port, _seen) = spawn_agent();
    let cfg = agent_config(port).with_propagation_styles(
        vec![PropagationStyle::Datadog, PropagationStyle::TraceContext],
        vec![PropagationStyle::Datadog, PropagationStyle::TraceContext],
    );
    let tracer = Tracer::new(cfg);

    let mut headers: HashMap<String, String> = HashMap::new();
    headers.insert("x-datadog-trace-id".to_string(), "4".to_string());
    headers.insert("x-datadog-parent-id".to_string(), "1".to_string());
    headers.insert("x-datadog-origin".to_string(), "synthetics".to_string());
    headers.insert(
        "traceparent".to_string(),
        "00-00000000000000000000000000000004-2222222222222222-01".to_string(),
    );
    headers.insert(
        "tracestate".to_string(),
        "dd=s:2;o:rum;p:0000000000000001;t.tid:1230000000000000~~,othervendor=t61rcWkgMzE"
            .to_string(),
    );

    let ctx = tracer.extract(&headers).expect("extract");
    tracer.stop();

    assert_eq!(ctx.trace_id().lower, 4);
    assert_eq!(ctx.span_id(), 0x2222_2222_2222_2222);
    assert_eq!(ctx.reparent_id().as_deref(), Some("0000000000000001"));
    assert_eq!(ctx.origin().as_deref(), Some("synthetics"));
}

#[test]
fn test_malformed_rules_rejected_before_startup() {
    let (port, _seen) = spawn_agent();
    assert!(meridian::SamplingRule::parse_json("[{\"sample_rate\": 9}]").is_err());
    // The tracer itself starts with safe defaults regardless.
    let tracer = Tracer::new(agent_config(port));
    let span = tracer.start_span("op", StartSpanOptions::default());
    assert!(span.context().sampling_priority().is_some());
    span.finish();
    tracer.stop();
}
