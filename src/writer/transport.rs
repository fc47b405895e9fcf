//! HTTP transport towards the trace agent
//!
//! One transport instance serves every agent endpoint. TCP agents go
//! through a shared reqwest blocking client; unix-socket agents get a
//! minimal hand-rolled HTTP/1.1 exchange over `UnixStream`, since the
//! protocol there is a single request/response per call.

use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde_derive::Deserialize;

const TRACE_COUNT_HEADER: &str = "X-Datadog-Trace-Count";
const META_LANG_HEADER: &str = "Datadog-Meta-Lang";
const META_VERSION_HEADER: &str = "Datadog-Meta-Tracer-Version";
const LANG: &str = "rust";
const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Backoff schedule for connection-level retries.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_millis(2500),
];

#[derive(Debug, Display, From, Error)]
pub enum TransportError {
    Http(reqwest::Error),
    Io(std::io::Error),
    #[display(fmt = "agent returned status {}", _0)]
    Status(#[error(not(source))] u16),
    #[display(fmt = "agent endpoint not found")]
    EndpointNotFound,
    #[display(fmt = "invalid agent url {}", _0)]
    InvalidUrl(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, TransportError>;

/// Trace endpoint generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V04,
    V05,
}

impl ApiVersion {
    pub fn path(&self) -> &'static str {
        match self {
            ApiVersion::V04 => "/v0.4/traces",
            ApiVersion::V05 => "/v0.5/traces",
        }
    }
}

pub struct TraceResponse {
    pub rate_by_service: Option<HashMap<String, f64>>,
}

#[derive(Deserialize)]
struct RateByServiceBody {
    rate_by_service: Option<HashMap<String, f64>>,
}

/// The seam between the writer pipeline and the wire. Tests install a
/// recording double here.
pub trait Transport: Send + Sync {
    fn send_traces(&self, body: &[u8], count: usize, version: ApiVersion) -> Result<TraceResponse>;
    fn send_stats(&self, body: &[u8]) -> Result<()>;
    fn send_pipeline_stats(&self, body: &[u8]) -> Result<()>;
    fn fetch_info(&self) -> Result<serde_json::Value>;
}

enum Endpoint {
    Tcp { base: String },
    Unix { path: String },
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: Endpoint,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(agent_url: &str, timeout: Duration) -> Result<HttpTransport> {
        let endpoint = if let Some(path) = agent_url.strip_prefix("unix://") {
            Endpoint::Unix {
                path: path.to_string(),
            }
        } else if agent_url.starts_with("http://") || agent_url.starts_with("https://") {
            Endpoint::Tcp {
                base: agent_url.trim_end_matches('/').to_string(),
            }
        } else {
            return Err(TransportError::InvalidUrl(agent_url.to_string()));
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpTransport {
            client,
            endpoint,
            timeout,
        })
    }

    fn retryable(err: &TransportError) -> bool {
        match err {
            TransportError::Http(e) => e.is_connect() || e.is_timeout(),
            TransportError::Io(_) => true,
            _ => false,
        }
    }

    /// Run the request with the connection-retry schedule, surfacing
    /// the last error.
    fn with_retries<T>(&self, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        for backoff in RETRY_BACKOFF.iter() {
            match call() {
                Ok(v) => return Ok(v),
                Err(e) if Self::retryable(&e) => {
                    log::debug!("agent request failed, retrying in {:?}: {}", backoff, e);
                    sleep(*backoff);
                }
                Err(e) => return Err(e),
            }
        }
        call()
    }

    fn post(
        &self,
        path: &str,
        content_type: &str,
        extra: &[(&str, String)],
        body: &[u8],
    ) -> Result<(u16, Vec<u8>)> {
        match &self.endpoint {
            Endpoint::Tcp { base } => {
                let mut req = self
                    .client
                    .post(&format!("{}{}", base, path))
                    .header("Content-Type", content_type)
                    .header(META_LANG_HEADER, LANG)
                    .header(META_VERSION_HEADER, TRACER_VERSION);
                for (k, v) in extra {
                    req = req.header(*k, v);
                }
                let resp = req.body(body.to_vec()).send()?;
                let status = resp.status().as_u16();
                let bytes = resp.bytes().map(|b| b.to_vec()).unwrap_or_default();
                Ok((status, bytes))
            }
            Endpoint::Unix { path: socket } => {
                let mut headers = vec![
                    ("Content-Type", content_type.to_string()),
                    (META_LANG_HEADER, LANG.to_string()),
                    (META_VERSION_HEADER, TRACER_VERSION.to_string()),
                ];
                for (k, v) in extra {
                    headers.push((*k, v.clone()));
                }
                unix_http_post(socket, path, &headers, body, self.timeout)
            }
        }
    }

    fn get(&self, path: &str) -> Result<(u16, Vec<u8>)> {
        match &self.endpoint {
            Endpoint::Tcp { base } => {
                let resp = self.client.get(&format!("{}{}", base, path)).send()?;
                let status = resp.status().as_u16();
                let bytes = resp.bytes().map(|b| b.to_vec()).unwrap_or_default();
                Ok((status, bytes))
            }
            Endpoint::Unix { path: socket } => unix_http_get(socket, path, self.timeout),
        }
    }
}

impl Transport for HttpTransport {
    fn send_traces(&self, body: &[u8], count: usize, version: ApiVersion) -> Result<TraceResponse> {
        let extra = [(TRACE_COUNT_HEADER, count.to_string())];
        let (status, resp_body) = self.with_retries(|| {
            self.post(version.path(), "application/msgpack", &extra, body)
        })?;
        match status {
            200..=299 => {
                let rate_by_service = serde_json::from_slice::<RateByServiceBody>(&resp_body)
                    .ok()
                    .and_then(|b| b.rate_by_service);
                Ok(TraceResponse { rate_by_service })
            }
            404 => Err(TransportError::EndpointNotFound),
            status => Err(TransportError::Status(status)),
        }
    }

    fn send_stats(&self, body: &[u8]) -> Result<()> {
        let (status, _) =
            self.with_retries(|| self.post("/v0.6/stats", "application/msgpack", &[], body))?;
        match status {
            200..=299 => Ok(()),
            404 => Err(TransportError::EndpointNotFound),
            status => Err(TransportError::Status(status)),
        }
    }

    fn send_pipeline_stats(&self, body: &[u8]) -> Result<()> {
        let extra = [("Content-Encoding", "gzip".to_string())];
        let (status, _) = self.with_retries(|| {
            self.post("/v0.1/pipeline_stats", "application/x-protobuf", &extra, body)
        })?;
        match status {
            200..=299 => Ok(()),
            404 => Err(TransportError::EndpointNotFound),
            status => Err(TransportError::Status(status)),
        }
    }

    fn fetch_info(&self) -> Result<serde_json::Value> {
        let (status, body) = self.with_retries(|| self.get("/info"))?;
        match status {
            200..=299 => Ok(serde_json::from_slice(&body)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))),
            404 => Err(TransportError::EndpointNotFound),
            status => Err(TransportError::Status(status)),
        }
    }
}

#[cfg(unix)]
fn unix_http_post(
    socket: &str,
    path: &str,
    headers: &[(&str, String)],
    body: &[u8],
    timeout: Duration,
) -> Result<(u16, Vec<u8>)> {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut req = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n",
        path,
        body.len()
    );
    for (k, v) in headers {
        req.push_str(&format!("{}: {}\r\n", k, v));
    }
    req.push_str("\r\n");
    stream.write_all(req.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    read_http_response(&mut stream)
}

#[cfg(unix)]
fn unix_http_get(socket: &str, path: &str, timeout: Duration) -> Result<(u16, Vec<u8>)> {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let req = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(req.as_bytes())?;
    stream.flush()?;
    read_http_response(&mut stream)
}

#[cfg(not(unix))]
fn unix_http_post(
    _socket: &str,
    _path: &str,
    _headers: &[(&str, String)],
    _body: &[u8],
    _timeout: Duration,
) -> Result<(u16, Vec<u8>)> {
    Err(TransportError::InvalidUrl(
        "unix sockets unsupported on this platform".to_string(),
    ))
}

#[cfg(not(unix))]
fn unix_http_get(_socket: &str, _path: &str, _timeout: Duration) -> Result<(u16, Vec<u8>)> {
    Err(TransportError::InvalidUrl(
        "unix sockets unsupported on this platform".to_string(),
    ))
}

#[cfg(unix)]
fn read_http_response(stream: &mut impl std::io::Read) -> Result<(u16, Vec<u8>)> {
    use std::io::Read;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated http response",
            ))
        })?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad http status line",
            ))
        })?;
    let mut body = raw[split + 4..].to_vec();
    // Connection: close means the body runs to EOF; chunked encoding is
    // only unwrapped for the single-chunk responses the agent sends.
    if head.to_lowercase().contains("transfer-encoding: chunked") {
        body = unchunk(&body);
    }
    Ok((status, body))
}

#[cfg(unix)]
fn unchunk(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let line_end = match rest.windows(2).position(|w| w == b"\r\n") {
            Some(p) => p,
            None => break,
        };
        let size = usize::from_str_radix(
            String::from_utf8_lossy(&rest[..line_end]).trim(),
            16,
        )
        .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        if rest.len() < start + size {
            break;
        }
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[(start + size + 2).min(rest.len())..];
    }
    out
}
