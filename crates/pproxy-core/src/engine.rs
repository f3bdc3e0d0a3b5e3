use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, header};
use tokio::sync::mpsc;

use pproxy_accesslog::AccessRecord;
use pproxy_rewrite::RewriteError;

use crate::state::AppState;
use crate::upstream_client::{UpstreamClient, UpstreamError, UpstreamRequest};

const MAX_LOG_BODY_BYTES: usize = 10 * 1024 * 1024;
const STREAMING_CONTENT_TYPES: [&str; 3] =
    ["text/event-stream", "application/x-ndjson", "text/plain"];

/// Per-request input assembled by the front-end after key authorization.
#[derive(Debug)]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub api_key: String,
    pub user_id: i64,
}

pub enum ProxyBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

/// Forwarding pipeline: model lookup against the snapshot, body rewrite,
/// upstream dispatch, header/status mirroring, body copy (line-at-a-time for
/// streaming content types), and exactly one access record per request,
/// emitted after the response is fully written or aborted.
pub struct ProxyEngine {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
}

impl ProxyEngine {
    pub fn new(state: Arc<AppState>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { state, client }
    }

    pub fn app(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Fan a record out to the registered loggers; never blocks.
    pub fn emit_record(&self, record: AccessRecord) {
        self.state.logs.log_to_all(record);
    }

    pub async fn handle(&self, req: ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        let mut record = base_record(&req);

        let model_id = pproxy_rewrite::extract_model_id(&req.body);
        record.model_id = model_id.clone();

        let Some(row) = self.state.models.load().get(&model_id) else {
            let message = format!("model record not found: {model_id}");
            return self.reject(record, started, StatusCode::NOT_FOUND, message);
        };
        let model = &row.record;
        record.target_model = model.target.clone();
        record.proxy_url = model.url.clone();
        if let Ok(upstream) = url::Url::parse(&model.url) {
            record.proxy_scheme = upstream.scheme().to_string();
            record.proxy_host = host_with_port(&upstream);
        }

        let rewritten = match pproxy_rewrite::rewrite_body(&req.body, model) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                let status = match err {
                    RewriteError::BadRequest(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                return self.reject(record, started, status, format!("prompt injection failed: {err}"));
            }
        };
        record.upstream_body = String::from_utf8_lossy(&rewritten).into_owned();

        let upstream_req = UpstreamRequest {
            method: req.method.clone(),
            url: model.url.clone(),
            headers: forward_headers(&req.headers),
            body: rewritten,
        };
        let upstream_resp = match self.client.send(upstream_req).await {
            Ok(resp) => resp,
            Err(err) => {
                // Spec'd asymmetry: the client sees a 500, the record keeps
                // the zero status alongside the transport error.
                let message = format!("upstream request failed: {err}");
                record.error = message.clone();
                record.response_time_ms = started.elapsed().as_millis() as i64;
                self.emit_record(record);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &message);
            }
        };

        record.status_code = upstream_resp.status;
        let status =
            StatusCode::from_u16(upstream_resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = mirror_headers(&upstream_resp.headers);

        if is_streaming_content_type(&upstream_resp.headers) {
            let rx = self.spawn_line_copy(upstream_resp.body, record, started);
            ProxyResponse {
                status,
                headers,
                body: ProxyBody::Stream(rx),
            }
        } else {
            let mut body = Vec::new();
            let mut rx = upstream_resp.body;
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(chunk) => body.extend_from_slice(&chunk),
                    Err(err) => {
                        record.error = format!("reading upstream response failed: {err}");
                        break;
                    }
                }
            }
            record.response_size = body.len() as i64;
            record.response_body = lossy_capped(&body);
            record.response_time_ms = started.elapsed().as_millis() as i64;
            self.emit_record(record);
            ProxyResponse {
                status,
                headers,
                body: ProxyBody::Full(Bytes::from(body)),
            }
        }
    }

    /// Copy the upstream body to the client one line at a time, flushing each
    /// line as its own chunk. Client disconnect shows up as a failed send;
    /// the loop exits, the upstream receiver is dropped (releasing the
    /// connection), and the record carries the cancellation error.
    fn spawn_line_copy(
        &self,
        mut upstream: mpsc::Receiver<Result<Bytes, UpstreamError>>,
        mut record: AccessRecord,
        started: Instant,
    ) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let logs = self.state.logs.clone();
        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            let mut captured: Vec<u8> = Vec::new();
            let mut total: i64 = 0;
            let mut error: Option<String> = None;

            'recv: while let Some(item) = upstream.recv().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        error = Some(format!("reading upstream stream failed: {err}"));
                        break;
                    }
                };
                pending.extend_from_slice(&chunk);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    total += line.len() as i64;
                    append_capped(&mut captured, &line, MAX_LOG_BODY_BYTES);
                    if tx.send(Bytes::from(line)).await.is_err() {
                        error = Some("client disconnected before upstream finished".to_string());
                        break 'recv;
                    }
                }
            }

            // Tail without a trailing newline still reaches the client.
            if error.is_none() && !pending.is_empty() {
                let line = std::mem::take(&mut pending);
                total += line.len() as i64;
                append_capped(&mut captured, &line, MAX_LOG_BODY_BYTES);
                let _ = tx.send(Bytes::from(line)).await;
            }

            record.response_size = total;
            record.response_body = lossy_capped(&captured);
            record.response_time_ms = started.elapsed().as_millis() as i64;
            if let Some(error) = error {
                record.error = error;
            }
            logs.log_to_all(record);
        });
        rx
    }

    fn reject(
        &self,
        mut record: AccessRecord,
        started: Instant,
        status: StatusCode,
        message: String,
    ) -> ProxyResponse {
        record.status_code = status.as_u16();
        record.error = message.clone();
        record.response_time_ms = started.elapsed().as_millis() as i64;
        let resp = error_response(status, &message);
        if let ProxyBody::Full(body) = &resp.body {
            record.response_size = body.len() as i64;
            record.response_body = String::from_utf8_lossy(body).into_owned();
        }
        self.emit_record(record);
        resp
    }
}

fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    ProxyResponse {
        status,
        headers,
        body: ProxyBody::Full(Bytes::from(body)),
    }
}

fn base_record(req: &ProxyRequest) -> AccessRecord {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in &req.headers {
        if let Ok(value) = value.to_str() {
            // First value per name only.
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let mut record = AccessRecord::new();
    record.request_id = req.request_id.clone();
    record.method = req.method.to_string();
    record.path = req.path.clone();
    record.user_agent = req
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    record.client_ip = req.client_ip.clone();
    record.api_key = req.api_key.clone();
    record.user_id = req.user_id;
    record.request_size = req.body.len() as i64;
    record.request_body = String::from_utf8_lossy(&req.body).into_owned();
    record.headers = headers;
    record
}

/// All original headers travel upstream except framing and host, which are
/// derived from the rewritten body and the upstream URL.
fn forward_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in headers {
        if name == header::CONTENT_LENGTH || name == header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn mirror_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        // Drop hop-by-hop and framing headers; hyper sets framing itself.
        if is_hop_by_hop_or_framing_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            out.append(name, value);
        }
    }
    out
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

pub fn is_streaming_content_type(headers: &[(String, String)]) -> bool {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| {
            let value = value.to_ascii_lowercase();
            STREAMING_CONTENT_TYPES
                .iter()
                .any(|candidate| value.contains(candidate))
        })
        .unwrap_or(false)
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    if buf.len() >= cap {
        return;
    }
    let take = (cap - buf.len()).min(chunk.len());
    buf.extend_from_slice(&chunk[..take]);
}

fn lossy_capped(body: &[u8]) -> String {
    let take = body.len().min(MAX_LOG_BODY_BYTES);
    String::from_utf8_lossy(&body[..take]).into_owned()
}

fn host_with_port(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn streaming_detection_matches_known_types() {
        assert!(is_streaming_content_type(&headers(&[(
            "Content-Type",
            "text/event-stream; charset=utf-8"
        )])));
        assert!(is_streaming_content_type(&headers(&[(
            "content-type",
            "application/x-ndjson"
        )])));
        assert!(is_streaming_content_type(&headers(&[(
            "content-type",
            "text/plain"
        )])));
        assert!(!is_streaming_content_type(&headers(&[(
            "content-type",
            "application/json"
        )])));
        assert!(!is_streaming_content_type(&headers(&[])));
    }

    #[test]
    fn forward_headers_drops_framing_and_host() {
        let mut map = HeaderMap::new();
        map.insert(header::HOST, "proxy.local".parse().unwrap());
        map.insert(header::CONTENT_LENGTH, "12".parse().unwrap());
        map.insert("x-proxy-key", "ak_secret".parse().unwrap());
        map.insert(header::ACCEPT, "text/event-stream".parse().unwrap());

        let forwarded = forward_headers(&map);
        assert!(forwarded.iter().any(|(name, _)| name == "x-proxy-key"));
        assert!(forwarded.iter().any(|(name, _)| name == "accept"));
        assert!(!forwarded.iter().any(|(name, _)| name == "host"));
        assert!(!forwarded.iter().any(|(name, _)| name == "content-length"));
    }

    #[test]
    fn mirror_headers_filters_hop_by_hop() {
        let mirrored = mirror_headers(&headers(&[
            ("content-type", "text/event-stream"),
            ("transfer-encoding", "chunked"),
            ("connection", "keep-alive"),
            ("x-request-id", "abc"),
        ]));
        assert!(mirrored.contains_key("content-type"));
        assert!(mirrored.contains_key("x-request-id"));
        assert!(!mirrored.contains_key("transfer-encoding"));
        assert!(!mirrored.contains_key("connection"));
    }

    #[test]
    fn append_capped_stops_at_cap() {
        let mut buf = Vec::new();
        append_capped(&mut buf, b"abcdef", 4);
        append_capped(&mut buf, b"gh", 4);
        assert_eq!(buf, b"abcd");
    }

    #[test]
    fn host_with_port_formats() {
        let with_port = url::Url::parse("http://127.0.0.1:9100/v1").unwrap();
        assert_eq!(host_with_port(&with_port), "127.0.0.1:9100");
        let bare = url::Url::parse("https://api.example.com/v1").unwrap();
        assert_eq!(host_with_port(&bare), "api.example.com");
    }
}
