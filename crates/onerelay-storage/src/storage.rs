use async_trait::async_trait;

use onerelay_common::GlobalConfig;
use onerelay_provider_core::{Ability, Channel, ChannelStatus};
use time::OffsetDateTime;

use crate::snapshot::{ChannelSnapshot, GlobalConfigRow, TokenRow, TopUpRow, UserRow};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Balance columns moved by the quota ledger.
///
/// A positive delta means quota was spent, a negative one refunds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuotaField {
    /// `users.quota` goes down.
    UserQuota,
    /// `users.used_quota` goes up.
    UserUsedQuota,
    UserRequestCount,
    /// `tokens.remain_quota` goes down while `tokens.used_quota` goes up.
    TokenQuota,
    /// Only `tokens.used_quota` goes up; unlimited tokens keep their remain.
    TokenUsedQuota,
    ChannelUsedQuota,
}

/// Fields set together on every channel carrying a tag; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagUpdate {
    pub new_tag: Option<String>,
    pub priority: Option<i64>,
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Consume,
    Error,
    System,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Consume => "consume",
            LogKind::Error => "error",
            LogKind::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub created_at: OffsetDateTime,
    pub kind: LogKind,
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

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub role: i32,
}

#[derive(Debug, Clone)]
pub struct NewToken {
    pub user_id: i64,
    pub name: String,
    pub key_hash: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub model_limits: Vec<String>,
    pub group: Option<String>,
}

/// Persistence used by the relay.
///
/// - bootstrap and periodic refresh (`load_channel_snapshot`)
/// - admin mutations on channels
/// - identity lookups and quota movement
/// - consumption log and top-up bookkeeping
///
/// Channel selection never hits the DB; it reads the in-memory snapshot.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0).
    async fn sync(&self) -> StorageResult<()>;

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>>;
    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()>;

    // Channels and their derived abilities
    async fn load_channel_snapshot(&self) -> StorageResult<ChannelSnapshot>;
    async fn get_channel(&self, id: i64) -> StorageResult<Option<Channel>>;
    /// Inserts the channel and its abilities; returns the new id.
    async fn insert_channel(&self, channel: &Channel) -> StorageResult<i64>;
    /// Rewrites the channel row and regenerates its abilities.
    async fn update_channel(&self, channel: &Channel) -> StorageResult<()>;
    async fn delete_channel(&self, id: i64) -> StorageResult<()>;
    /// Moves the channel and every one of its abilities to `status`.
    async fn set_channel_status(&self, id: i64, status: ChannelStatus) -> StorageResult<()>;
    async fn record_channel_test(
        &self,
        id: i64,
        response_time_ms: i64,
        tested_at: i64,
    ) -> StorageResult<()>;
    async fn set_status_by_tag(&self, tag: &str, status: ChannelStatus) -> StorageResult<u64>;
    async fn update_channels_by_tag(&self, tag: &str, update: &TagUpdate) -> StorageResult<u64>;

    async fn list_abilities(&self) -> StorageResult<Vec<Ability>>;
    /// Deletes and regenerates the channel's abilities in one transaction.
    async fn replace_channel_abilities(&self, channel: &Channel) -> StorageResult<()>;
    /// Removes orphaned abilities and regenerates inconsistent ones; returns the
    /// number of items fixed.
    async fn fix_abilities(&self) -> StorageResult<usize>;

    // Identity
    async fn insert_user(&self, user: &NewUser) -> StorageResult<i64>;
    async fn get_user(&self, id: i64) -> StorageResult<Option<UserRow>>;
    async fn insert_token(&self, token: &NewToken) -> StorageResult<i64>;
    async fn find_token_by_key_hash(&self, key_hash: &str) -> StorageResult<Option<TokenRow>>;
    async fn get_token(&self, id: i64) -> StorageResult<Option<TokenRow>>;

    // Quota
    async fn apply_quota_delta(&self, field: QuotaField, id: i64, delta: i64) -> StorageResult<()>;

    // Logs
    async fn append_log(&self, record: &LogRecord) -> StorageResult<()>;
    async fn count_logs(&self, user_id: i64) -> StorageResult<u64>;

    // Top-ups
    async fn insert_top_up(&self, user_id: i64, trade_no: &str, amount: i64) -> StorageResult<i64>;
    async fn find_top_up(&self, trade_no: &str) -> StorageResult<Option<TopUpRow>>;
    /// Marks a pending top-up successful and credits the user in one transaction.
    /// Returns `false` when the row was no longer pending.
    async fn complete_top_up(&self, trade_no: &str) -> StorageResult<bool>;
}
