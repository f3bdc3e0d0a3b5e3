use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;

use pproxy_accesslog::{LoggerRegistry, default_output_config};
use pproxy_auth::AuthService;
use pproxy_core::{AppState, ModelSnapshot};
use pproxy_router::admin_router;
use pproxy_storage::{SqlStorage, Storage};

async fn test_state(dir: &std::path::Path) -> Arc<AppState> {
    let storage = Arc::new(SqlStorage::connect("sqlite::memory:").await.unwrap());
    storage.sync().await.unwrap();
    let auth = Arc::new(AuthService::bootstrap(storage.clone()).await.unwrap());
    let logs = Arc::new(LoggerRegistry::new());
    logs.add_logger(default_output_config(&dir.join("logs")))
        .unwrap();
    Arc::new(AppState {
        models: ArcSwap::from_pointee(ModelSnapshot::from_rows(Vec::new())),
        storage,
        auth,
        logs,
        config_dir: dir.to_path_buf(),
        proxy_port: 8080,
        admin_port: 8081,
    })
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, JsonValue) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null)
    };
    (status, body)
}

fn get(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn send_json(method: &str, path: &str, token: Option<&str>, body: JsonValue) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn bootstrap_install_flow() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let router = admin_router(state);

    let (status, body) = send(&router, get("/api/v1/auth/check-install", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["is_first_install"], true);

    let (status, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/auth/register",
            None,
            json!({"username": "root", "password": "p"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["is_admin"], true);
    let token = body["data"]["token"].as_str().unwrap().to_string();

    // Install is one-shot.
    let (status, _) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/auth/register",
            None,
            json!({"username": "other", "password": "p"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&router, get("/api/v1/auth/check-install", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_first_install"], false);

    let (status, body) = send(&router, get("/api/v1/auth/profile", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "root");

    let (status, _) = send(&router, get("/api/v1/auth/profile", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn model_crud_refreshes_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let router = admin_router(state.clone());

    let (_, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/auth/register",
            None,
            json!({"username": "root", "password": "p"}),
        ),
    )
    .await;
    let token = body["data"]["token"].as_str().unwrap().to_string();

    let record = json!({
        "id": "X",
        "name": "X",
        "target": "gpt-3.5-turbo",
        "prompt": "You are X.",
        "url": "https://api.example.com/v1/chat/completions",
        "type": "chat",
    });
    let (status, body) = send(
        &router,
        send_json("POST", "/api/v1/models", Some(&token), record.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Chat defaulting filled the injection rule.
    assert_eq!(body["data"]["prompt_path"], "messages");
    assert_eq!(state.model_count(), 1);

    // Duplicate ids conflict.
    let (status, _) = send(
        &router,
        send_json("POST", "/api/v1/models", Some(&token), record),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Update without prompt_value clears it durably.
    let (status, body) = send(
        &router,
        send_json(
            "PUT",
            "/api/v1/models/X",
            Some(&token),
            json!({
                "name": "X",
                "target": "gpt-4",
                "url": "https://api.example.com/v1/chat/completions",
                "type": "chat",
                "prompt_path": "messages",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["target"], "gpt-4");
    assert_eq!(body["data"]["prompt_value"], JsonValue::Null);

    let (status, body) = send(&router, get("/api/v1/models/X", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["prompt_value"], JsonValue::Null);

    let (status, _) = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri("/api/v1/models/X")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.model_count(), 0);

    let (status, _) = send(&router, get("/api/v1/models/X", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn user_management_requires_admin() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let router = admin_router(state);

    let (_, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/auth/register",
            None,
            json!({"username": "root", "password": "p"}),
        ),
    )
    .await;
    let admin_token = body["data"]["token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/users",
            Some(&admin_token),
            json!({"username": "alice", "is_admin": false}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let alice_password = body["data"]["generated_password"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/auth/login",
            None,
            json!({"username": "alice", "password": alice_password}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let alice_token = body["data"]["token"].as_str().unwrap().to_string();

    // Non-admins are kept out of user management but keep self-service.
    let (status, _) = send(&router, get("/api/v1/users", Some(&alice_token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&router, get("/api/v1/api-keys", Some(&alice_token))).await;
    assert_eq!(status, StatusCode::OK);

    // The bootstrap admin never shows up in the listing.
    let (status, body) = send(&router, get("/api/v1/users", Some(&admin_token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["users"][0]["username"], "alice");
}

#[tokio::test]
async fn api_key_create_reveals_value_once() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path()).await;
    let router = admin_router(state);

    let (_, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/auth/register",
            None,
            json!({"username": "root", "password": "p"}),
        ),
    )
    .await;
    let token = body["data"]["token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        send_json(
            "POST",
            "/api/v1/api-keys",
            Some(&token),
            json!({"name": "ci"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let key_value = body["data"]["key_value"].as_str().unwrap();
    assert!(key_value.starts_with("ak_"));

    let (status, body) = send(&router, get("/api/v1/api-keys", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert!(body["data"]["api_keys"][0].get("key_value").is_none());
    assert!(
        body["data"]["api_keys"][0]["key_preview"]
            .as_str()
            .unwrap()
            .ends_with("***")
    );
}
