use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_records")]
pub struct Model {
    /// Client-facing model id.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub target: String,
    pub url: String,
    pub kind: String,
    pub prompt: String,
    pub prompt_path: String,
    /// JSON-encoded prompt value; empty string means "not set".
    #[sea_orm(column_type = "Text")]
    pub prompt_value: String,
    pub prompt_value_type: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
