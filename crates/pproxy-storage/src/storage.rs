use async_trait::async_trait;
use time::OffsetDateTime;

use pproxy_common::ModelRecord;

use crate::snapshot::{ApiKeyRow, ModelRow, StorageSnapshot, UserRow};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub is_enabled: bool,
    pub created_by: i64,
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub user_id: i64,
    pub name: String,
    pub key_value: String,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub username: Option<String>,
    pub is_admin: Option<bool>,
    pub is_enabled: Option<bool>,
}

/// Authoritative durable store for model records, users, API keys, and
/// metadata. Admin mutations and credential lookups go through here; the
/// proxy request path reads model records from an in-memory snapshot instead.
///
/// Timestamps are assigned by the store; callers never write them.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync. Run once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    // Model records
    async fn count_models(&self) -> StorageResult<u64>;
    async fn insert_model(&self, record: &ModelRecord) -> StorageResult<ModelRow>;
    /// Full-row update. Every column is written explicitly so that a cleared
    /// `prompt_value` reaches the store instead of being skipped as "no
    /// change".
    async fn update_model(&self, record: &ModelRecord) -> StorageResult<ModelRow>;
    async fn get_model(&self, id: &str) -> StorageResult<ModelRow>;
    /// All records, `updated_at` descending.
    async fn list_models(&self) -> StorageResult<Vec<ModelRow>>;
    async fn delete_model(&self, id: &str) -> StorageResult<()>;
    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    // Metadata
    async fn get_metadata(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set_metadata(&self, key: &str, value: &str) -> StorageResult<()>;

    // Users
    async fn count_users(&self) -> StorageResult<u64>;
    async fn insert_user(&self, user: NewUser) -> StorageResult<UserRow>;
    async fn get_user_by_id(&self, id: i64) -> StorageResult<UserRow>;
    async fn find_user_by_username(&self, username: &str) -> StorageResult<Option<UserRow>>;
    /// All users, `created_at` descending.
    async fn list_users(&self) -> StorageResult<Vec<UserRow>>;
    async fn update_user(&self, id: i64, patch: UserPatch) -> StorageResult<UserRow>;
    async fn update_user_password(&self, id: i64, password_hash: &str) -> StorageResult<()>;
    async fn set_user_enabled(&self, id: i64, enabled: bool) -> StorageResult<()>;
    /// Best-effort stamp; callers treat failure as non-fatal.
    async fn touch_user_login(&self, id: i64) -> StorageResult<()>;
    async fn delete_user(&self, id: i64) -> StorageResult<()>;

    // API keys
    async fn insert_api_key(&self, key: NewApiKey) -> StorageResult<ApiKeyRow>;
    /// Keys owned by `user_id`, `created_at` descending.
    async fn list_api_keys(&self, user_id: i64) -> StorageResult<Vec<ApiKeyRow>>;
    async fn find_api_key_by_value(&self, key_value: &str) -> StorageResult<Option<ApiKeyRow>>;
    /// Best-effort stamp; callers treat failure as non-fatal.
    async fn touch_api_key_used(&self, key_value: &str) -> StorageResult<()>;
    /// Owner-scoped toggle of the key's enabled flag.
    async fn set_api_key_enabled(
        &self,
        id: i64,
        user_id: i64,
        enabled: bool,
    ) -> StorageResult<()>;
    /// Owner-scoped delete: removes the key only if `user_id` owns it.
    async fn delete_api_key(&self, id: i64, user_id: i64) -> StorageResult<()>;
}
