use time::OffsetDateTime;

use pproxy_common::ModelRecord;

#[derive(Debug, Clone)]
pub struct ModelRow {
    pub record: ModelRecord,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub is_enabled: bool,
    pub last_login_at: Option<OffsetDateTime>,
    pub created_by: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub key_value: String,
    pub is_enabled: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Full export of the model-record table, in `updated_at` descending order.
/// The proxy and admin front-ends hold this as an immutable snapshot and swap
/// it atomically on reload.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub models: Vec<ModelRow>,
}
