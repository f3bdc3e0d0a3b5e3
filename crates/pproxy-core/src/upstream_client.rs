use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::Client;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub message: String,
}

impl UpstreamError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: http::Method,
    pub url: String,
    /// Ordered header pairs, already filtered for forwarding.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Upstream response with the body surfaced as a chunk channel. The engine
/// decides whether to buffer or forward line-by-line once it has seen the
/// response headers; an `Err` item carries a mid-stream transport failure.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: mpsc::Receiver<Result<Bytes, UpstreamError>>,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>>;
}

/// wreq-backed client. Timeouts are left to the client library's own
/// defaults; the core imposes none.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new() -> Result<Self, wreq::Error> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let method = wreq::Method::from_bytes(req.method.as_str().as_bytes())
                .map_err(|_| UpstreamError::new(format!("unsupported method {}", req.method)))?;
            let mut builder = self.client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            let resp = builder
                .body(req.body)
                .send()
                .await
                .map_err(|err| UpstreamError::new(err.to_string()))?;

            let status = resp.status().as_u16();
            let headers = headers_to_vec(resp.headers());

            let (tx, rx) = mpsc::channel::<Result<Bytes, UpstreamError>>(16);
            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                while let Some(item) = stream.next().await {
                    let out = item.map_err(|err| UpstreamError::new(err.to_string()));
                    let failed = out.is_err();
                    if tx.send(out).await.is_err() || failed {
                        break;
                    }
                }
            });

            Ok(UpstreamResponse {
                status,
                headers,
                body: rx,
            })
        })
    }
}

fn headers_to_vec(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}
