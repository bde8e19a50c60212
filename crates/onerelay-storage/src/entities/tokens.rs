use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[sea_orm(unique_key = "token_key_hash")]
    pub key_hash: String,
    pub enabled: bool,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    /// Comma separated allow-list; empty means every model.
    pub model_limits: Option<String>,
    pub group: Option<String>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
