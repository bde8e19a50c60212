use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub role: i32,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub tokens: HasMany<super::tokens::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
