use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Schema,
};
use time::OffsetDateTime;

use pproxy_common::{ModelKind, ModelRecord, PromptValueType};

use crate::entities;
use crate::snapshot::{ApiKeyRow, ModelRow, StorageSnapshot, UserRow};
use crate::storage::{NewApiKey, NewUser, Storage, StorageError, StorageResult, UserPatch};

#[derive(Clone)]
pub struct SqlStorage {
    db: DatabaseConnection,
}

impl SqlStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn require_user(&self, id: i64) -> StorageResult<entities::users::Model> {
        entities::Users::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
    }
}

#[async_trait::async_trait]
impl Storage for SqlStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ModelRecords)
            .register(entities::Metadata)
            .register(entities::Users)
            .register(entities::ApiKeys)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn count_models(&self) -> StorageResult<u64> {
        Ok(entities::ModelRecords::find().count(&self.db).await?)
    }

    async fn insert_model(&self, record: &ModelRecord) -> StorageResult<ModelRow> {
        use entities::model_records::ActiveModel as RecordActive;

        let existing = entities::ModelRecords::find_by_id(&record.id)
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Err(StorageError::Conflict(format!(
                "model record {}",
                record.id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let active = RecordActive {
            id: ActiveValue::Set(record.id.clone()),
            name: ActiveValue::Set(record.name.clone()),
            target: ActiveValue::Set(record.target.clone()),
            url: ActiveValue::Set(record.url.clone()),
            kind: ActiveValue::Set(record.kind.as_str().to_string()),
            prompt: ActiveValue::Set(record.prompt.clone()),
            prompt_path: ActiveValue::Set(record.prompt_path.clone()),
            prompt_value: ActiveValue::Set(encode_prompt_value(record)?),
            prompt_value_type: ActiveValue::Set(encode_value_type(record)),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let model = active.insert(&self.db).await?;
        Ok(row_from_model_entity(model))
    }

    async fn update_model(&self, record: &ModelRecord) -> StorageResult<ModelRow> {
        use entities::model_records::ActiveModel as RecordActive;

        let existing = entities::ModelRecords::find_by_id(&record.id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("model record {}", record.id)))?;

        // Every mutable column is enumerated here on purpose: a cleared
        // prompt_value must land in the store as an empty string, not be
        // treated as "column omitted, keep the old value".
        let now = OffsetDateTime::now_utc();
        let mut active: RecordActive = existing.into();
        active.name = ActiveValue::Set(record.name.clone());
        active.target = ActiveValue::Set(record.target.clone());
        active.url = ActiveValue::Set(record.url.clone());
        active.kind = ActiveValue::Set(record.kind.as_str().to_string());
        active.prompt = ActiveValue::Set(record.prompt.clone());
        active.prompt_path = ActiveValue::Set(record.prompt_path.clone());
        active.prompt_value = ActiveValue::Set(encode_prompt_value(record)?);
        active.prompt_value_type = ActiveValue::Set(encode_value_type(record));
        active.updated_at = ActiveValue::Set(now);
        let model = active.update(&self.db).await?;
        Ok(row_from_model_entity(model))
    }

    async fn get_model(&self, id: &str) -> StorageResult<ModelRow> {
        let model = entities::ModelRecords::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("model record {id}")))?;
        Ok(row_from_model_entity(model))
    }

    async fn list_models(&self) -> StorageResult<Vec<ModelRow>> {
        use entities::model_records::Column;
        let rows = entities::ModelRecords::find()
            .order_by_desc(Column::UpdatedAt)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(row_from_model_entity).collect())
    }

    async fn delete_model(&self, id: &str) -> StorageResult<()> {
        let result = entities::ModelRecords::delete_by_id(id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound(format!("model record {id}")));
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        Ok(StorageSnapshot {
            models: self.list_models().await?,
        })
    }

    async fn get_metadata(&self, key: &str) -> StorageResult<Option<String>> {
        let row = entities::Metadata::find_by_id(key).one(&self.db).await?;
        Ok(row.map(|m| m.value))
    }

    async fn set_metadata(&self, key: &str, value: &str) -> StorageResult<()> {
        use entities::metadata::ActiveModel as MetadataActive;

        let now = OffsetDateTime::now_utc();
        let existing = entities::Metadata::find_by_id(key).one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: MetadataActive = model.into();
                active.value = ActiveValue::Set(value.to_string());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = MetadataActive {
                    key: ActiveValue::Set(key.to_string()),
                    value: ActiveValue::Set(value.to_string()),
                    updated_at: ActiveValue::Set(now),
                };
                entities::Metadata::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn count_users(&self) -> StorageResult<u64> {
        Ok(entities::Users::find().count(&self.db).await?)
    }

    async fn insert_user(&self, user: NewUser) -> StorageResult<UserRow> {
        use entities::users::{ActiveModel as UserActive, Column};

        let existing = entities::Users::find()
            .filter(Column::Username.eq(&user.username))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Err(StorageError::Conflict(format!("username {}", user.username)));
        }

        let now = OffsetDateTime::now_utc();
        let active = UserActive {
            id: ActiveValue::NotSet,
            username: ActiveValue::Set(user.username),
            password_hash: ActiveValue::Set(user.password_hash),
            is_admin: ActiveValue::Set(user.is_admin),
            is_enabled: ActiveValue::Set(user.is_enabled),
            last_login_at: ActiveValue::Set(None),
            created_by: ActiveValue::Set(user.created_by),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let model = active.insert(&self.db).await?;
        Ok(row_from_user_entity(model))
    }

    async fn get_user_by_id(&self, id: i64) -> StorageResult<UserRow> {
        Ok(row_from_user_entity(self.require_user(id).await?))
    }

    async fn find_user_by_username(&self, username: &str) -> StorageResult<Option<UserRow>> {
        use entities::users::Column;
        let row = entities::Users::find()
            .filter(Column::Username.eq(username))
            .one(&self.db)
            .await?;
        Ok(row.map(row_from_user_entity))
    }

    async fn list_users(&self) -> StorageResult<Vec<UserRow>> {
        use entities::users::Column;
        let rows = entities::Users::find()
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(row_from_user_entity).collect())
    }

    async fn update_user(&self, id: i64, patch: UserPatch) -> StorageResult<UserRow> {
        use entities::users::{ActiveModel as UserActive, Column};

        let existing = self.require_user(id).await?;

        if let Some(username) = patch.username.as_deref()
            && username != existing.username
        {
            let taken = entities::Users::find()
                .filter(Column::Username.eq(username))
                .one(&self.db)
                .await?;
            if taken.is_some() {
                return Err(StorageError::Conflict(format!("username {username}")));
            }
        }

        let now = OffsetDateTime::now_utc();
        let mut active: UserActive = existing.into();
        if let Some(username) = patch.username {
            active.username = ActiveValue::Set(username);
        }
        if let Some(is_admin) = patch.is_admin {
            active.is_admin = ActiveValue::Set(is_admin);
        }
        if let Some(is_enabled) = patch.is_enabled {
            active.is_enabled = ActiveValue::Set(is_enabled);
        }
        active.updated_at = ActiveValue::Set(now);
        let model = active.update(&self.db).await?;
        Ok(row_from_user_entity(model))
    }

    async fn update_user_password(&self, id: i64, password_hash: &str) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;

        let existing = self.require_user(id).await?;
        let now = OffsetDateTime::now_utc();
        let mut active: UserActive = existing.into();
        active.password_hash = ActiveValue::Set(password_hash.to_string());
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_user_enabled(&self, id: i64, enabled: bool) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;

        let existing = self.require_user(id).await?;
        let now = OffsetDateTime::now_utc();
        let mut active: UserActive = existing.into();
        active.is_enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn touch_user_login(&self, id: i64) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;

        let existing = self.require_user(id).await?;
        let mut active: UserActive = existing.into();
        active.last_login_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_user(&self, id: i64) -> StorageResult<()> {
        // DB-level ON DELETE CASCADE removes the user's api keys.
        let result = entities::Users::delete_by_id(id).exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn insert_api_key(&self, key: NewApiKey) -> StorageResult<ApiKeyRow> {
        use entities::api_keys::{ActiveModel as ApiKeyActive, Column};

        let existing = entities::ApiKeys::find()
            .filter(Column::KeyValue.eq(&key.key_value))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Err(StorageError::Conflict("api key value".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let active = ApiKeyActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(key.user_id),
            name: ActiveValue::Set(key.name),
            key_value: ActiveValue::Set(key.key_value),
            is_enabled: ActiveValue::Set(true),
            expires_at: ActiveValue::Set(key.expires_at),
            last_used_at: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let model = active.insert(&self.db).await?;
        Ok(row_from_api_key_entity(model))
    }

    async fn list_api_keys(&self, user_id: i64) -> StorageResult<Vec<ApiKeyRow>> {
        use entities::api_keys::Column;
        let rows = entities::ApiKeys::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(row_from_api_key_entity).collect())
    }

    async fn find_api_key_by_value(&self, key_value: &str) -> StorageResult<Option<ApiKeyRow>> {
        use entities::api_keys::Column;
        let row = entities::ApiKeys::find()
            .filter(Column::KeyValue.eq(key_value))
            .one(&self.db)
            .await?;
        Ok(row.map(row_from_api_key_entity))
    }

    async fn touch_api_key_used(&self, key_value: &str) -> StorageResult<()> {
        use entities::api_keys::{ActiveModel as ApiKeyActive, Column};

        let existing = entities::ApiKeys::find()
            .filter(Column::KeyValue.eq(key_value))
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound("api key".to_string()))?;
        let mut active: ApiKeyActive = existing.into();
        active.last_used_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_api_key_enabled(
        &self,
        id: i64,
        user_id: i64,
        enabled: bool,
    ) -> StorageResult<()> {
        use entities::api_keys::{ActiveModel as ApiKeyActive, Column};

        let existing = entities::ApiKeys::find_by_id(id)
            .filter(Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("api key {id}")))?;
        let mut active: ApiKeyActive = existing.into();
        active.is_enabled = ActiveValue::Set(enabled);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn delete_api_key(&self, id: i64, user_id: i64) -> StorageResult<()> {
        use entities::api_keys::Column;
        let result = entities::ApiKeys::delete_many()
            .filter(Column::Id.eq(id))
            .filter(Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound(format!("api key {id}")));
        }
        Ok(())
    }
}

fn encode_prompt_value(record: &ModelRecord) -> StorageResult<String> {
    match &record.prompt_value {
        Some(value) => Ok(serde_json::to_string(value)?),
        // Cleared values are stored as the empty string and decode to absent.
        None => Ok(String::new()),
    }
}

fn encode_value_type(record: &ModelRecord) -> String {
    record
        .prompt_value_type
        .map(|t| t.as_str().to_string())
        .unwrap_or_default()
}

fn row_from_model_entity(model: entities::model_records::Model) -> ModelRow {
    let prompt_value = if model.prompt_value.is_empty() {
        None
    } else {
        // A non-JSON column value is carried as a plain string rather than
        // dropped, so a record never loses its configured fragment.
        Some(
            serde_json::from_str(&model.prompt_value)
                .unwrap_or(serde_json::Value::String(model.prompt_value.clone())),
        )
    };
    ModelRow {
        record: ModelRecord {
            id: model.id,
            name: model.name,
            target: model.target,
            prompt: model.prompt,
            url: model.url,
            kind: ModelKind::parse(&model.kind).unwrap_or_default(),
            prompt_path: model.prompt_path,
            prompt_value,
            prompt_value_type: PromptValueType::parse(&model.prompt_value_type),
        },
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

fn row_from_user_entity(model: entities::users::Model) -> UserRow {
    UserRow {
        id: model.id,
        username: model.username,
        password_hash: model.password_hash,
        is_admin: model.is_admin,
        is_enabled: model.is_enabled,
        last_login_at: model.last_login_at,
        created_by: model.created_by,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}

fn row_from_api_key_entity(model: entities::api_keys::Model) -> ApiKeyRow {
    ApiKeyRow {
        id: model.id,
        user_id: model.user_id,
        name: model.name,
        key_value: model.key_value,
        is_enabled: model.is_enabled,
        expires_at: model.expires_at,
        last_used_at: model.last_used_at,
        created_at: model.created_at,
        updated_at: model.updated_at,
    }
}
