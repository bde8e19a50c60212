use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub channel_type: i32,
    pub key: String,
    pub base_url: Option<String>,
    /// Comma separated.
    pub models: String,
    /// Comma separated.
    pub groups: String,
    pub status: i32,
    pub priority: i64,
    pub weight: i32,
    pub tag: Option<String>,
    pub auto_ban: bool,
    pub test_model: Option<String>,
    pub model_mapping: Json,
    pub other: Option<String>,
    pub organization: Option<String>,
    pub settings: Json,
    pub param_override: Json,
    pub header_override: Json,
    pub response_time_ms: i64,
    pub test_time: i64,
    pub used_quota: i64,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
