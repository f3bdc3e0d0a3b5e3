use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Extension, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use pproxy_accesslog::AccessRecord;
use pproxy_auth::AuthError;
use pproxy_core::{ProxyBody, ProxyEngine, ProxyRequest, ProxyResponse};

const PROXY_KEY_HEADER: &str = "x-proxy-key";

#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
}

/// Attached by the auth middleware once the API key checks out.
#[derive(Debug, Clone)]
struct ProxyIdentity {
    request_id: String,
    client_ip: String,
    api_key: String,
    user_id: i64,
}

/// Every method and path is forwarded; the only gate is the key check.
pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState { engine };
    Router::new()
        .route("/", any(forward))
        .route("/{*path}", any(forward))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .with_state(state)
}

async fn proxy_auth(
    State(state): State<ProxyState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let request_id = uuid::Uuid::new_v4().simple().to_string();
    let client_ip = resolve_client_ip(addr, req.headers());

    let key = req
        .headers()
        .get(PROXY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let Some(key) = key else {
        let message = "missing credentials: set the X-Proxy-Key header";
        emit_rejection(
            &state,
            &req,
            &request_id,
            &client_ip,
            "",
            StatusCode::UNAUTHORIZED,
            message,
        );
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response();
    };

    match state.engine.app().auth.verify_api_key(&key).await {
        Ok(row) => {
            req.extensions_mut().insert(ProxyIdentity {
                request_id,
                client_ip,
                api_key: key,
                user_id: row.user_id,
            });
            next.run(req).await
        }
        Err(err) => {
            let status = match err {
                AuthError::Storage(_) | AuthError::Crypto(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::UNAUTHORIZED,
            };
            let message = err.to_string();
            emit_rejection(&state, &req, &request_id, &client_ip, &key, status, &message);
            (status, Json(serde_json::json!({ "error": message }))).into_response()
        }
    }
}

/// Rejected requests still produce exactly one access record.
fn emit_rejection(
    state: &ProxyState,
    req: &axum::http::Request<Body>,
    request_id: &str,
    client_ip: &str,
    api_key: &str,
    status: StatusCode,
    message: &str,
) {
    let mut record = AccessRecord::new();
    record.request_id = request_id.to_string();
    record.method = req.method().to_string();
    record.path = req.uri().path().to_string();
    record.user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    record.client_ip = client_ip.to_string();
    record.api_key = api_key.to_string();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            record
                .headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    record.status_code = status.as_u16();
    record.error = message.to_string();
    state.engine.emit_record(record);
}

async fn forward(
    State(state): State<ProxyState>,
    Extension(identity): Extension<ProxyIdentity>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let out = state
        .engine
        .handle(ProxyRequest {
            request_id: identity.request_id,
            method,
            path: uri.path().to_string(),
            headers,
            body,
            client_ip: identity.client_ip,
            api_key: identity.api_key,
            user_id: identity.user_id,
        })
        .await;
    to_response(out)
}

fn to_response(resp: ProxyResponse) -> Response {
    let streaming = matches!(resp.body, ProxyBody::Stream(_));
    let mut builder = Response::builder().status(resp.status);
    if let Some(out) = builder.headers_mut() {
        for (name, value) in resp.headers.iter() {
            out.append(name, value.clone());
        }
        if streaming {
            // Hint common reverse proxies to avoid buffering the stream.
            out.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            out.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }
    let body = match resp.body {
        ProxyBody::Full(bytes) => Body::from(bytes),
        ProxyBody::Stream(rx) => {
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
    };
    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

/// First-hop remote address, normalized; `X-Forwarded-For`'s first entry wins
/// over it, and `x-real-ip` wins over both.
fn resolve_client_ip(addr: SocketAddr, headers: &HeaderMap) -> String {
    let mut ip = normalize_remote_ip(addr.ip());

    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            ip = first.to_string();
        }
    }

    if let Some(real) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real = real.trim();
        if !real.is_empty() {
            ip = real.to_string();
        }
    }

    ip
}

fn normalize_remote_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) if v6.is_loopback() => "127.0.0.1".to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}
