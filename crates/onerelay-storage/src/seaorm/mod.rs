mod convert;

use std::collections::{BTreeSet, HashMap, HashSet};

use sea_orm::sea_query::{Expr, Index};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, DbErr, EntityTrait, ExprTrait, PaginatorTrait, QueryFilter, QueryOrder,
    Schema, TransactionTrait,
};
use time::OffsetDateTime;
use tracing::info;

use onerelay_common::{GlobalConfig, RelaySettings};
use onerelay_provider_core::{Ability, Channel, ChannelStatus};

use crate::entities;
use crate::snapshot::{ChannelSnapshot, GlobalConfigRow, TokenRow, TopUpRow, TopUpStatus, UserRow};
use crate::storage::{
    LogRecord, NewToken, NewUser, QuotaField, Storage, StorageError, StorageResult, TagUpdate,
};

use convert::{
    ability_active, ability_from_model, channel_active, channel_from_model, token_from_model,
    top_up_from_model, user_from_model,
};

/// Abilities are written in batches of this size to stay under bind-parameter limits.
pub const ABILITY_BATCH: usize = 50;

const GLOBAL_CONFIG_ID: i64 = 1;

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
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

    async fn ensure_indexes(&self) -> StorageResult<()> {
        use entities::abilities::Column as AbilityColumn;
        use entities::channels::Column as ChannelColumn;
        use entities::logs::Column as LogColumn;

        let statements = [
            Index::create()
                .name("idx_abilities_channel_id")
                .table(entities::abilities::Entity)
                .col(AbilityColumn::ChannelId)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_abilities_tag")
                .table(entities::abilities::Entity)
                .col(AbilityColumn::Tag)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_channels_tag")
                .table(entities::channels::Entity)
                .col(ChannelColumn::Tag)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_logs_user_created_at")
                .table(entities::logs::Entity)
                .col(LogColumn::UserId)
                .col(LogColumn::CreatedAt)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }
}

/// Replaces every ability of `channel` on `conn`; callers wrap this in a transaction.
async fn write_abilities<C: ConnectionTrait>(conn: &C, channel: &Channel) -> Result<(), DbErr> {
    use entities::abilities::Column;

    entities::Abilities::delete_many()
        .filter(Column::ChannelId.eq(channel.id))
        .exec(conn)
        .await?;

    let rows: Vec<entities::abilities::ActiveModel> =
        channel.abilities().into_iter().map(ability_active).collect();
    for chunk in rows.chunks(ABILITY_BATCH) {
        entities::Abilities::insert_many(chunk.to_vec())
            .exec_without_returning(conn)
            .await?;
    }
    Ok(())
}

fn flatten_txn<T>(result: Result<T, sea_orm::TransactionError<DbErr>>) -> StorageResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(sea_orm::TransactionError::Connection(err)) => Err(err.into()),
        Err(sea_orm::TransactionError::Transaction(err)) => Err(err.into()),
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Channels)
            .register(entities::Abilities)
            .register(entities::Users)
            .register(entities::Tokens)
            .register(entities::Logs)
            .register(entities::TopUps)
            .sync(&self.db)
            .await?;
        self.ensure_indexes().await?;
        Ok(())
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
        use entities::global_config::Column;
        let row = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        let Some(m) = row else {
            return Ok(None);
        };
        let settings: RelaySettings = if serde_json::Value::is_null(&m.settings_json) {
            RelaySettings::default()
        } else {
            serde_json::from_value(m.settings_json)?
        };
        Ok(Some(GlobalConfigRow {
            id: m.id,
            config: GlobalConfig {
                host: m.host,
                port: u16::try_from(m.port).unwrap_or(3000),
                admin_key_hash: m.admin_key_hash,
                proxy: m.proxy,
                dsn: m.dsn,
                log_consume_content: m.log_consume_content,
                settings,
            },
            updated_at: m.updated_at,
        }))
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()> {
        use entities::global_config::ActiveModel as GlobalActive;

        let now = OffsetDateTime::now_utc();
        let settings_json = serde_json::to_value(&config.settings)?;
        let existing = entities::GlobalConfig::find_by_id(GLOBAL_CONFIG_ID)
            .one(&self.db)
            .await?;

        match existing {
            Some(model) => {
                let mut active: GlobalActive = model.into();
                active.host = ActiveValue::Set(config.host.clone());
                active.port = ActiveValue::Set(i32::from(config.port));
                active.admin_key_hash = ActiveValue::Set(config.admin_key_hash.clone());
                active.proxy = ActiveValue::Set(config.proxy.clone());
                active.dsn = ActiveValue::Set(config.dsn.clone());
                active.log_consume_content = ActiveValue::Set(config.log_consume_content);
                active.settings_json = ActiveValue::Set(settings_json);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = GlobalActive {
                    id: ActiveValue::Set(GLOBAL_CONFIG_ID),
                    host: ActiveValue::Set(config.host.clone()),
                    port: ActiveValue::Set(i32::from(config.port)),
                    admin_key_hash: ActiveValue::Set(config.admin_key_hash.clone()),
                    proxy: ActiveValue::Set(config.proxy.clone()),
                    dsn: ActiveValue::Set(config.dsn.clone()),
                    log_consume_content: ActiveValue::Set(config.log_consume_content),
                    settings_json: ActiveValue::Set(settings_json),
                    updated_at: ActiveValue::Set(now),
                };
                entities::GlobalConfig::insert(active)
                    .exec(&self.db)
                    .await?;
            }
        }
        Ok(())
    }

    async fn load_channel_snapshot(&self) -> StorageResult<ChannelSnapshot> {
        let channels = entities::Channels::find()
            .order_by_asc(entities::channels::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(channel_from_model)
            .collect::<StorageResult<Vec<_>>>()?;
        let abilities = self.list_abilities().await?;
        Ok(ChannelSnapshot {
            channels,
            abilities,
        })
    }

    async fn get_channel(&self, id: i64) -> StorageResult<Option<Channel>> {
        entities::Channels::find_by_id(id)
            .one(&self.db)
            .await?
            .map(channel_from_model)
            .transpose()
    }

    async fn insert_channel(&self, channel: &Channel) -> StorageResult<i64> {
        let mut active = channel_active(channel)?;
        active.response_time_ms = ActiveValue::Set(0);
        active.test_time = ActiveValue::Set(0);
        active.used_quota = ActiveValue::Set(0);
        active.created_at = ActiveValue::Set(OffsetDateTime::now_utc());
        let mut channel = channel.clone();

        let result = self
            .db
            .transaction::<_, i64, DbErr>(move |txn| {
                Box::pin(async move {
                    let inserted = entities::Channels::insert(active).exec(txn).await?;
                    channel.id = inserted.last_insert_id;
                    write_abilities(txn, &channel).await?;
                    Ok(channel.id)
                })
            })
            .await;
        flatten_txn(result)
    }

    async fn update_channel(&self, channel: &Channel) -> StorageResult<()> {
        let mut active = channel_active(channel)?;
        active.id = ActiveValue::Set(channel.id);
        let channel = channel.clone();

        let result = self
            .db
            .transaction::<_, (), DbErr>(move |txn| {
                Box::pin(async move {
                    entities::Channels::update(active).exec(txn).await?;
                    write_abilities(txn, &channel).await?;
                    Ok(())
                })
            })
            .await;
        flatten_txn(result)
    }

    async fn delete_channel(&self, id: i64) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        entities::Abilities::delete_many()
            .filter(entities::abilities::Column::ChannelId.eq(id))
            .exec(&txn)
            .await?;
        entities::Channels::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn set_channel_status(&self, id: i64, status: ChannelStatus) -> StorageResult<()> {
        use entities::abilities::Column as AbilityColumn;
        use entities::channels::Column as ChannelColumn;

        let txn = self.db.begin().await?;
        let updated = entities::Channels::update_many()
            .col_expr(ChannelColumn::Status, Expr::value(status.as_i32()))
            .filter(ChannelColumn::Id.eq(id))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(StorageError::NotFound("channel"));
        }
        entities::Abilities::update_many()
            .col_expr(
                AbilityColumn::Enabled,
                Expr::value(status == ChannelStatus::Enabled),
            )
            .filter(AbilityColumn::ChannelId.eq(id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn record_channel_test(
        &self,
        id: i64,
        response_time_ms: i64,
        tested_at: i64,
    ) -> StorageResult<()> {
        use entities::channels::Column;
        entities::Channels::update_many()
            .col_expr(Column::ResponseTimeMs, Expr::value(response_time_ms))
            .col_expr(Column::TestTime, Expr::value(tested_at))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_status_by_tag(&self, tag: &str, status: ChannelStatus) -> StorageResult<u64> {
        use entities::abilities::Column as AbilityColumn;
        use entities::channels::Column as ChannelColumn;

        let txn = self.db.begin().await?;
        let updated = entities::Channels::update_many()
            .col_expr(ChannelColumn::Status, Expr::value(status.as_i32()))
            .filter(ChannelColumn::Tag.eq(tag))
            .exec(&txn)
            .await?;
        entities::Abilities::update_many()
            .col_expr(
                AbilityColumn::Enabled,
                Expr::value(status == ChannelStatus::Enabled),
            )
            .filter(AbilityColumn::Tag.eq(tag))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(updated.rows_affected)
    }

    async fn update_channels_by_tag(&self, tag: &str, update: &TagUpdate) -> StorageResult<u64> {
        use entities::abilities::Column as AbilityColumn;
        use entities::channels::Column as ChannelColumn;

        if update == &TagUpdate::default() {
            return Ok(0);
        }

        let mut channels = entities::Channels::update_many().filter(ChannelColumn::Tag.eq(tag));
        let mut abilities = entities::Abilities::update_many().filter(AbilityColumn::Tag.eq(tag));
        if let Some(new_tag) = update.new_tag.as_deref() {
            let new_tag = Some(new_tag.to_string()).filter(|tag| !tag.is_empty());
            channels = channels.col_expr(ChannelColumn::Tag, Expr::value(new_tag.clone()));
            abilities = abilities.col_expr(AbilityColumn::Tag, Expr::value(new_tag));
        }
        if let Some(priority) = update.priority {
            channels = channels.col_expr(ChannelColumn::Priority, Expr::value(priority));
            abilities = abilities.col_expr(AbilityColumn::Priority, Expr::value(priority));
        }
        if let Some(weight) = update.weight {
            let weight = i32::try_from(weight).unwrap_or(i32::MAX);
            channels = channels.col_expr(ChannelColumn::Weight, Expr::value(weight));
            abilities = abilities.col_expr(AbilityColumn::Weight, Expr::value(weight));
        }

        let txn = self.db.begin().await?;
        let updated = channels.exec(&txn).await?;
        abilities.exec(&txn).await?;
        txn.commit().await?;
        Ok(updated.rows_affected)
    }

    async fn list_abilities(&self) -> StorageResult<Vec<Ability>> {
        let rows = entities::Abilities::find().all(&self.db).await?;
        Ok(rows.into_iter().map(ability_from_model).collect())
    }

    async fn replace_channel_abilities(&self, channel: &Channel) -> StorageResult<()> {
        let channel = channel.clone();
        let result = self
            .db
            .transaction::<_, (), DbErr>(move |txn| {
                Box::pin(async move { write_abilities(txn, &channel).await })
            })
            .await;
        flatten_txn(result)
    }

    async fn fix_abilities(&self) -> StorageResult<usize> {
        use entities::abilities::Column;

        let channels = entities::Channels::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(channel_from_model)
            .collect::<StorageResult<Vec<_>>>()?;
        let channel_ids: HashSet<i64> = channels.iter().map(|c| c.id).collect();

        let mut existing: HashMap<i64, HashSet<Ability>> = HashMap::new();
        for ability in self.list_abilities().await? {
            existing
                .entry(ability.channel_id)
                .or_default()
                .insert(ability);
        }

        let mut fixed = 0usize;
        let orphans: BTreeSet<i64> = existing
            .keys()
            .copied()
            .filter(|id| !channel_ids.contains(id))
            .collect();
        if !orphans.is_empty() {
            let removed = entities::Abilities::delete_many()
                .filter(Column::ChannelId.is_in(orphans.iter().copied()))
                .exec(&self.db)
                .await?;
            fixed += removed.rows_affected as usize;
        }

        for channel in &channels {
            let expected: HashSet<Ability> = channel.abilities().into_iter().collect();
            let current = existing.remove(&channel.id).unwrap_or_default();
            if current != expected {
                self.replace_channel_abilities(channel).await?;
                fixed += 1;
            }
        }

        info!(event = "abilities_fixed", fixed, orphan_channels = orphans.len());
        Ok(fixed)
    }

    async fn insert_user(&self, user: &NewUser) -> StorageResult<i64> {
        let active = entities::users::ActiveModel {
            id: ActiveValue::NotSet,
            username: ActiveValue::Set(user.username.clone()),
            group: ActiveValue::Set(user.group.clone()),
            quota: ActiveValue::Set(user.quota),
            used_quota: ActiveValue::Set(0),
            request_count: ActiveValue::Set(0),
            role: ActiveValue::Set(user.role),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        let inserted = entities::Users::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn get_user(&self, id: i64) -> StorageResult<Option<UserRow>> {
        let row = entities::Users::find_by_id(id).one(&self.db).await?;
        Ok(row.map(user_from_model))
    }

    async fn insert_token(&self, token: &NewToken) -> StorageResult<i64> {
        let limits = (!token.model_limits.is_empty()).then(|| token.model_limits.join(","));
        let active = entities::tokens::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(token.user_id),
            name: ActiveValue::Set(token.name.clone()),
            key_hash: ActiveValue::Set(token.key_hash.clone()),
            enabled: ActiveValue::Set(true),
            remain_quota: ActiveValue::Set(token.remain_quota),
            unlimited_quota: ActiveValue::Set(token.unlimited_quota),
            used_quota: ActiveValue::Set(0),
            model_limits: ActiveValue::Set(limits),
            group: ActiveValue::Set(token.group.clone()),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        let inserted = entities::Tokens::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn find_token_by_key_hash(&self, key_hash: &str) -> StorageResult<Option<TokenRow>> {
        let row = entities::Tokens::find()
            .filter(entities::tokens::Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?;
        Ok(row.map(token_from_model))
    }

    async fn get_token(&self, id: i64) -> StorageResult<Option<TokenRow>> {
        let row = entities::Tokens::find_by_id(id).one(&self.db).await?;
        Ok(row.map(token_from_model))
    }

    async fn apply_quota_delta(&self, field: QuotaField, id: i64, delta: i64) -> StorageResult<()> {
        use entities::channels::Column as ChannelColumn;
        use entities::tokens::Column as TokenColumn;
        use entities::users::Column as UserColumn;

        if delta == 0 {
            return Ok(());
        }
        match field {
            QuotaField::UserQuota => {
                entities::Users::update_many()
                    .col_expr(UserColumn::Quota, Expr::col(UserColumn::Quota).sub(delta))
                    .filter(UserColumn::Id.eq(id))
                    .exec(&self.db)
                    .await?;
            }
            QuotaField::UserUsedQuota => {
                entities::Users::update_many()
                    .col_expr(UserColumn::UsedQuota, Expr::col(UserColumn::UsedQuota).add(delta))
                    .filter(UserColumn::Id.eq(id))
                    .exec(&self.db)
                    .await?;
            }
            QuotaField::UserRequestCount => {
                entities::Users::update_many()
                    .col_expr(
                        UserColumn::RequestCount,
                        Expr::col(UserColumn::RequestCount).add(delta),
                    )
                    .filter(UserColumn::Id.eq(id))
                    .exec(&self.db)
                    .await?;
            }
            QuotaField::TokenQuota => {
                entities::Tokens::update_many()
                    .col_expr(
                        TokenColumn::RemainQuota,
                        Expr::col(TokenColumn::RemainQuota).sub(delta),
                    )
                    .col_expr(TokenColumn::UsedQuota, Expr::col(TokenColumn::UsedQuota).add(delta))
                    .filter(TokenColumn::Id.eq(id))
                    .exec(&self.db)
                    .await?;
            }
            QuotaField::TokenUsedQuota => {
                entities::Tokens::update_many()
                    .col_expr(TokenColumn::UsedQuota, Expr::col(TokenColumn::UsedQuota).add(delta))
                    .filter(TokenColumn::Id.eq(id))
                    .exec(&self.db)
                    .await?;
            }
            QuotaField::ChannelUsedQuota => {
                entities::Channels::update_many()
                    .col_expr(
                        ChannelColumn::UsedQuota,
                        Expr::col(ChannelColumn::UsedQuota).add(delta),
                    )
                    .filter(ChannelColumn::Id.eq(id))
                    .exec(&self.db)
                    .await?;
            }
        }
        Ok(())
    }

    async fn append_log(&self, record: &LogRecord) -> StorageResult<()> {
        let active = entities::logs::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::Set(record.created_at),
            kind: ActiveValue::Set(record.kind.as_str().to_string()),
            user_id: ActiveValue::Set(record.user_id),
            token_id: ActiveValue::Set(record.token_id),
            channel_id: ActiveValue::Set(record.channel_id),
            model_name: ActiveValue::Set(record.model_name.clone()),
            group: ActiveValue::Set(record.group.clone()),
            prompt_tokens: ActiveValue::Set(record.prompt_tokens),
            completion_tokens: ActiveValue::Set(record.completion_tokens),
            quota: ActiveValue::Set(record.quota),
            use_time_ms: ActiveValue::Set(record.use_time_ms),
            is_stream: ActiveValue::Set(record.is_stream),
            content: ActiveValue::Set(record.content.clone()),
        };
        entities::Logs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn count_logs(&self, user_id: i64) -> StorageResult<u64> {
        let count = entities::Logs::find()
            .filter(entities::logs::Column::UserId.eq(user_id))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn insert_top_up(&self, user_id: i64, trade_no: &str, amount: i64) -> StorageResult<i64> {
        let active = entities::top_ups::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            trade_no: ActiveValue::Set(trade_no.to_string()),
            amount: ActiveValue::Set(amount),
            status: ActiveValue::Set(TopUpStatus::Pending.as_str().to_string()),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            completed_at: ActiveValue::Set(None),
        };
        let inserted = entities::TopUps::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn find_top_up(&self, trade_no: &str) -> StorageResult<Option<TopUpRow>> {
        let row = entities::TopUps::find()
            .filter(entities::top_ups::Column::TradeNo.eq(trade_no))
            .one(&self.db)
            .await?;
        Ok(row.map(top_up_from_model))
    }

    async fn complete_top_up(&self, trade_no: &str) -> StorageResult<bool> {
        use entities::top_ups::Column as TopUpColumn;
        use entities::users::Column as UserColumn;

        let txn = self.db.begin().await?;
        let Some(row) = entities::TopUps::find()
            .filter(TopUpColumn::TradeNo.eq(trade_no))
            .one(&txn)
            .await?
        else {
            return Err(StorageError::NotFound("top-up"));
        };

        // Conditional on the pending status so a racing writer cannot credit twice.
        let updated = entities::TopUps::update_many()
            .col_expr(
                TopUpColumn::Status,
                Expr::value(TopUpStatus::Success.as_str()),
            )
            .col_expr(
                TopUpColumn::CompletedAt,
                Expr::value(Some(OffsetDateTime::now_utc())),
            )
            .filter(TopUpColumn::Id.eq(row.id))
            .filter(TopUpColumn::Status.eq(TopUpStatus::Pending.as_str()))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Ok(false);
        }

        entities::Users::update_many()
            .col_expr(UserColumn::Quota, Expr::col(UserColumn::Quota).add(row.amount))
            .filter(UserColumn::Id.eq(row.user_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(true)
    }
}
