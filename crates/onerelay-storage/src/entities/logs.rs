use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub created_at: OffsetDateTime,
    pub kind: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub group: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub use_time_ms: i64,
    pub is_stream: bool,
    pub content: String,
}

impl ActiveModelBehavior for ActiveModel {}
