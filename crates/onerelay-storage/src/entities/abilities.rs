use sea_orm::entity::prelude::*;

/// Derived from `channels`; rows are regenerated, never patched one by one.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "abilities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub group: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub model: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i32,
    pub tag: Option<String>,
}

impl ActiveModelBehavior for ActiveModel {}
