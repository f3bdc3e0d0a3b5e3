use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tower_http::cors::CorsLayer;

use pproxy_auth::AuthError;
use pproxy_common::ModelRecord;
use pproxy_core::AppState;
use pproxy_storage::{ApiKeyRow, ModelRow, StorageError, UserPatch, UserRow};

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
}

/// Claims attached by the session middleware.
#[derive(Debug, Clone)]
struct SessionUser {
    user_id: i64,
    is_admin: bool,
}

/// Management surface under `/api/v1`. CORS is wide open; the admin listener
/// is assumed to sit behind an operator-controlled perimeter.
pub fn admin_router(app: Arc<AppState>) -> Router {
    let state = AdminState { app };

    let public = Router::new()
        .route("/auth/check-install", get(check_install))
        .route("/auth/public-key", get(public_key))
        .route("/auth/register", post(register))
        .route("/auth/encrypted-register", post(encrypted_register))
        .route("/auth/login", post(login))
        .route("/auth/encrypted-login", post(encrypted_login))
        .route("/config/system", get(system_config))
        .route("/health", get(health));

    let admin_only = Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", put(update_user).delete(delete_user))
        .route("/users/{id}/status", put(update_user_status))
        .route("/users/{id}/password", put(admin_reset_password))
        .layer(middleware::from_fn(require_admin));

    let protected = Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/profile", get(profile))
        .route("/models", get(list_models).post(create_model))
        .route(
            "/models/{id}",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/config/reload", post(reload_config))
        .route("/config/status", get(config_status))
        .route("/user/password", put(change_password))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/{id}", delete(delete_api_key))
        .route("/api-keys/{id}/status", put(update_api_key_status))
        .route("/logs", get(list_log_files))
        .route("/logs/{name}", get(read_log_file))
        .merge(admin_only)
        .layer(middleware::from_fn_with_state(state.clone(), session_auth));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", public.merge(protected))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---- Middleware ----

async fn session_auth(
    State(state): State<AdminState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        return fail(StatusCode::UNAUTHORIZED, "missing session token");
    };
    match state.app.auth.verify_token(&token) {
        Ok(claims) => {
            req.extensions_mut().insert(SessionUser {
                user_id: claims.user_id,
                is_admin: claims.is_admin,
            });
            next.run(req).await
        }
        Err(_) => fail(StatusCode::UNAUTHORIZED, "invalid session token"),
    }
}

async fn require_admin(req: axum::http::Request<Body>, next: Next) -> Response {
    match req.extensions().get::<SessionUser>() {
        Some(session) if session.is_admin => next.run(req).await,
        _ => fail(StatusCode::FORBIDDEN, "administrator privileges required"),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let prefix = "Bearer ";
    if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        let token = value[prefix.len()..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

// ---- Response envelope ----

fn ok(data: impl Serialize) -> Response {
    Json(json!({ "code": 0, "message": "success", "data": data })).into_response()
}

fn ok_message(message: &str) -> Response {
    Json(json!({ "code": 0, "message": message })).into_response()
}

fn ok_with(message: &str, data: impl Serialize) -> Response {
    Json(json!({ "code": 0, "message": message, "data": data })).into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "code": status.as_u16(), "message": message.into() })),
    )
        .into_response()
}

fn auth_error(err: AuthError) -> Response {
    let status = match &err {
        AuthError::InvalidCredentials
        | AuthError::AccountDisabled
        | AuthError::InvalidToken
        | AuthError::InvalidApiKey
        | AuthError::ApiKeyDisabled
        | AuthError::ApiKeyExpired => StatusCode::UNAUTHORIZED,
        AuthError::InstallCompleted | AuthError::UsernameTaken => StatusCode::CONFLICT,
        AuthError::WrongPassword
        | AuthError::BadEnvelope
        | AuthError::SelfDeletion
        | AuthError::SelfDisable => StatusCode::BAD_REQUEST,
        AuthError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
        AuthError::Storage(StorageError::Conflict(_)) => StatusCode::CONFLICT,
        AuthError::Storage(_) | AuthError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

fn storage_error(err: StorageError) -> Response {
    let status = match &err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, err.to_string())
}

fn ts(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

fn ts_opt(at: Option<OffsetDateTime>) -> JsonValue {
    match at {
        Some(at) => JsonValue::String(ts(at)),
        None => JsonValue::Null,
    }
}

// ---- Health / system ----

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn system_config(State(state): State<AdminState>) -> Response {
    ok(json!({
        "proxy_port": state.app.proxy_port,
        "admin_port": state.app.admin_port,
    }))
}

// ---- Auth ----

async fn check_install(State(state): State<AdminState>) -> Response {
    match state.app.auth.is_first_install().await {
        Ok(is_first_install) => ok(json!({ "is_first_install": is_first_install })),
        Err(err) => auth_error(err),
    }
}

/// The keypair is process-lifetime only: after a restart, envelopes built
/// against an earlier key fail with 400 and the client must re-fetch.
async fn public_key(State(state): State<AdminState>) -> Response {
    match state.app.auth.public_key_pem() {
        Ok(public_key) => ok(json!({ "public_key": public_key })),
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsPayload {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct EncryptedCredentialsPayload {
    username: String,
    encrypted_password: String,
}

fn session_json(session: &pproxy_auth::Session) -> JsonValue {
    json!({
        "token": session.token,
        "expires_at": session.expires_at,
        "user": user_json(&session.user),
    })
}

async fn register(
    State(state): State<AdminState>,
    Json(payload): Json<CredentialsPayload>,
) -> Response {
    match state
        .app
        .auth
        .register(&payload.username, &payload.password)
        .await
    {
        Ok(session) => ok_with("registered", session_json(&session)),
        Err(err) => auth_error(err),
    }
}

async fn encrypted_register(
    State(state): State<AdminState>,
    Json(payload): Json<EncryptedCredentialsPayload>,
) -> Response {
    match state
        .app
        .auth
        .encrypted_register(&payload.username, &payload.encrypted_password)
        .await
    {
        Ok(session) => ok_with("registered", session_json(&session)),
        Err(err) => auth_error(err),
    }
}

async fn login(
    State(state): State<AdminState>,
    Json(payload): Json<CredentialsPayload>,
) -> Response {
    match state
        .app
        .auth
        .login(&payload.username, &payload.password)
        .await
    {
        Ok(session) => ok_with("logged in", session_json(&session)),
        Err(err) => auth_error(err),
    }
}

async fn encrypted_login(
    State(state): State<AdminState>,
    Json(payload): Json<EncryptedCredentialsPayload>,
) -> Response {
    match state
        .app
        .auth
        .encrypted_login(&payload.username, &payload.encrypted_password)
        .await
    {
        Ok(session) => ok_with("logged in", session_json(&session)),
        Err(err) => auth_error(err),
    }
}

/// Stateless tokens: the server has nothing to revoke, the client discards.
async fn logout() -> Response {
    ok_message("logged out")
}

async fn profile(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
) -> Response {
    match state.app.auth.get_user(session.user_id).await {
        Ok(user) => ok(user_json(&user)),
        Err(err) => auth_error(err),
    }
}

// ---- Model records ----

fn model_json(row: &ModelRow) -> JsonValue {
    let record = &row.record;
    json!({
        "id": record.id,
        "name": record.name,
        "target": record.target,
        "prompt": record.prompt,
        "url": record.url,
        "type": record.kind.as_str(),
        "prompt_path": record.prompt_path,
        "prompt_value": record.prompt_value,
        "prompt_value_type": record.prompt_value_type.map(|t| t.as_str()),
        "created_at": ts(row.created_at),
        "updated_at": ts(row.updated_at),
    })
}

async fn list_models(State(state): State<AdminState>) -> Response {
    match state.app.storage.list_models().await {
        Ok(rows) => {
            let models: Vec<JsonValue> = rows.iter().map(model_json).collect();
            ok(json!({ "models": models, "total": models.len() }))
        }
        Err(err) => storage_error(err),
    }
}

async fn get_model(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.app.storage.get_model(&id).await {
        Ok(row) => ok(model_json(&row)),
        Err(err) => storage_error(err),
    }
}

async fn create_model(
    State(state): State<AdminState>,
    Json(mut record): Json<ModelRecord>,
) -> Response {
    if let Err(err) = record.validate() {
        return fail(StatusCode::BAD_REQUEST, err.to_string());
    }
    match state.app.storage.insert_model(&record).await {
        Ok(row) => {
            state.app.apply_model_upsert(row.clone());
            ok_with("model created", model_json(&row))
        }
        Err(err) => storage_error(err),
    }
}

/// Update payload carries the full record body; a missing `prompt_value`
/// means "clear it", which the store persists explicitly.
#[derive(Debug, Deserialize)]
struct UpdateModelPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "type")]
    kind: pproxy_common::ModelKind,
    #[serde(default)]
    prompt_path: String,
    #[serde(default)]
    prompt_value: Option<JsonValue>,
    #[serde(default, alias = "prompt_type")]
    prompt_value_type: Option<pproxy_common::PromptValueType>,
}

async fn update_model(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateModelPayload>,
) -> Response {
    let mut record = ModelRecord {
        id,
        name: payload.name,
        target: payload.target,
        prompt: payload.prompt,
        url: payload.url,
        kind: payload.kind,
        prompt_path: payload.prompt_path,
        prompt_value: payload.prompt_value,
        prompt_value_type: payload.prompt_value_type,
    };
    if let Err(err) = record.validate() {
        return fail(StatusCode::BAD_REQUEST, err.to_string());
    }
    match state.app.storage.update_model(&record).await {
        Ok(row) => {
            state.app.apply_model_upsert(row.clone());
            ok_with("model updated", model_json(&row))
        }
        Err(err) => storage_error(err),
    }
}

async fn delete_model(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.app.storage.delete_model(&id).await {
        Ok(()) => {
            state.app.apply_model_delete(&id);
            ok_message("model deleted")
        }
        Err(err) => storage_error(err),
    }
}

// ---- Config ----

async fn reload_config(State(state): State<AdminState>) -> Response {
    match state.app.reload_models().await {
        Ok(total_models) => ok_with(
            "configuration reloaded",
            json!({ "total_models": total_models }),
        ),
        Err(err) => storage_error(err),
    }
}

async fn config_status(State(state): State<AdminState>) -> Response {
    ok(json!({
        "status": "running",
        "total_models": state.app.model_count(),
        "config_dir": state.app.config_dir.display().to_string(),
    }))
}

// ---- Users ----

fn user_json(user: &UserRow) -> JsonValue {
    json!({
        "id": user.id,
        "username": user.username,
        "is_admin": user.is_admin,
        "is_enabled": user.is_enabled,
        "last_login_at": ts_opt(user.last_login_at),
        "created_by": user.created_by,
        "created_at": ts(user.created_at),
        "updated_at": ts(user.updated_at),
    })
}

async fn list_users(State(state): State<AdminState>) -> Response {
    match state.app.auth.list_users().await {
        Ok(users) => {
            let users: Vec<JsonValue> = users.iter().map(user_json).collect();
            ok(json!({ "users": users, "total": users.len() }))
        }
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateUserPayload {
    username: String,
    #[serde(default)]
    is_admin: bool,
}

async fn create_user(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Json(payload): Json<CreateUserPayload>,
) -> Response {
    match state
        .app
        .auth
        .create_user(&payload.username, payload.is_admin, session.user_id)
        .await
    {
        Ok(created) => ok_with(
            "user created",
            json!({
                "user": user_json(&created.user),
                // Shown exactly once; only the hash survives.
                "generated_password": created.generated_password,
            }),
        ),
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateUserPayload {
    username: Option<String>,
    is_admin: Option<bool>,
    is_enabled: Option<bool>,
}

async fn update_user(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateUserPayload>,
) -> Response {
    let patch = UserPatch {
        username: payload.username.filter(|name| !name.trim().is_empty()),
        is_admin: payload.is_admin,
        is_enabled: payload.is_enabled,
    };
    match state.app.auth.update_user(id, patch).await {
        Ok(user) => ok_with("user updated", user_json(&user)),
        Err(err) => auth_error(err),
    }
}

async fn delete_user(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Path(id): Path<i64>,
) -> Response {
    match state.app.auth.delete_user(session.user_id, id).await {
        Ok(()) => ok_message("user deleted"),
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct UserStatusPayload {
    is_enabled: bool,
}

async fn update_user_status(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Path(id): Path<i64>,
    Json(payload): Json<UserStatusPayload>,
) -> Response {
    match state
        .app
        .auth
        .set_user_status(session.user_id, id, payload.is_enabled)
        .await
    {
        Ok(()) => ok_message("user status updated"),
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ResetPasswordPayload {
    new_password: String,
}

async fn admin_reset_password(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(payload): Json<ResetPasswordPayload>,
) -> Response {
    match state
        .app
        .auth
        .reset_password(id, &payload.new_password)
        .await
    {
        Ok(()) => ok_message("password reset"),
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ChangePasswordPayload {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Json(payload): Json<ChangePasswordPayload>,
) -> Response {
    match state
        .app
        .auth
        .change_password(session.user_id, &payload.old_password, &payload.new_password)
        .await
    {
        Ok(()) => ok_message("password changed"),
        Err(err) => auth_error(err),
    }
}

// ---- API keys ----

fn api_key_json(key: &ApiKeyRow, reveal: bool) -> JsonValue {
    let preview = if key.key_value.len() > 8 {
        format!("{}***", &key.key_value[..8])
    } else {
        format!("{}***", key.key_value)
    };
    let mut out = json!({
        "id": key.id,
        "name": key.name,
        "key_preview": preview,
        "is_enabled": key.is_enabled,
        "expires_at": ts_opt(key.expires_at),
        "last_used_at": ts_opt(key.last_used_at),
        "created_at": ts(key.created_at),
        "updated_at": ts(key.updated_at),
    });
    if reveal {
        out["key_value"] = JsonValue::String(key.key_value.clone());
    }
    out
}

async fn list_api_keys(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
) -> Response {
    match state.app.auth.list_api_keys(session.user_id).await {
        Ok(keys) => {
            let keys: Vec<JsonValue> = keys.iter().map(|key| api_key_json(key, false)).collect();
            ok(json!({ "api_keys": keys, "total": keys.len() }))
        }
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateApiKeyPayload {
    name: String,
    /// Optional caller-supplied secret; generated when absent.
    key_value: Option<String>,
    /// RFC 3339; empty means no expiry.
    #[serde(default)]
    expires_at: String,
}

async fn create_api_key(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Json(payload): Json<CreateApiKeyPayload>,
) -> Response {
    let expires_at = if payload.expires_at.trim().is_empty() {
        None
    } else {
        match OffsetDateTime::parse(payload.expires_at.trim(), &Rfc3339) {
            Ok(at) => Some(at),
            Err(err) => {
                return fail(
                    StatusCode::BAD_REQUEST,
                    format!("invalid expires_at: {err}"),
                );
            }
        }
    };
    match state
        .app
        .auth
        .create_api_key(session.user_id, &payload.name, payload.key_value, expires_at)
        .await
    {
        // The full key value is included only in this response.
        Ok(created) => ok_with("api key created", api_key_json(&created.row, true)),
        Err(err) => auth_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ApiKeyStatusPayload {
    is_enabled: bool,
}

async fn update_api_key_status(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Path(id): Path<i64>,
    Json(payload): Json<ApiKeyStatusPayload>,
) -> Response {
    match state
        .app
        .auth
        .set_api_key_status(session.user_id, id, payload.is_enabled)
        .await
    {
        Ok(()) => ok_message("api key status updated"),
        Err(err) => auth_error(err),
    }
}

async fn delete_api_key(
    State(state): State<AdminState>,
    Extension(session): Extension<SessionUser>,
    Path(id): Path<i64>,
) -> Response {
    match state.app.auth.delete_api_key(session.user_id, id).await {
        Ok(()) => ok_message("api key deleted"),
        Err(err) => auth_error(err),
    }
}

// ---- Access-log readback ----

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default = "default_logger")]
    logger: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    limit: u64,
}

fn default_logger() -> String {
    "default".to_string()
}

async fn list_log_files(
    State(state): State<AdminState>,
    Query(query): Query<LogQuery>,
) -> Response {
    let Some(logger) = state.app.logs.get(&query.logger) else {
        return fail(StatusCode::NOT_FOUND, format!("no logger named {}", query.logger));
    };
    match logger.list_files() {
        Ok(files) => {
            let total = files.len();
            ok(json!({ "files": files, "total": total }))
        }
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn read_log_file(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    let Some(logger) = state.app.logs.get(&query.logger) else {
        return fail(StatusCode::NOT_FOUND, format!("no logger named {}", query.logger));
    };
    match logger.read_slice(&name, query.offset, query.limit) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bytes,
        )
            .into_response(),
        Err(pproxy_accesslog::AccessLogError::UnknownFile(name)) => {
            fail(StatusCode::NOT_FOUND, format!("log file not found: {name}"))
        }
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def".to_string()));

        headers.insert(header::AUTHORIZATION, "bearer xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("xyz".to_string()));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn api_key_preview_hides_the_tail() {
        let now = OffsetDateTime::now_utc();
        let key = ApiKeyRow {
            id: 1,
            user_id: 1,
            name: "ci".to_string(),
            key_value: "ak_0123456789".to_string(),
            is_enabled: true,
            expires_at: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };
        let listed = api_key_json(&key, false);
        assert_eq!(listed["key_preview"], "ak_01234***");
        assert!(listed.get("key_value").is_none());

        let created = api_key_json(&key, true);
        assert_eq!(created["key_value"], "ak_0123456789");
    }
}
