use onerelay_common::GlobalConfig;
use onerelay_provider_core::{Ability, Channel};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
    pub updated_at: OffsetDateTime,
}

pub const ROLE_COMMON: i32 = 1;
pub const ROLE_ROOT: i32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub role: i32,
    pub enabled: bool,
}

impl UserRow {
    pub fn is_root(&self) -> bool {
        self.role >= ROLE_ROOT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub key_hash: String,
    pub enabled: bool,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    pub model_limits: Vec<String>,
    pub group: Option<String>,
}

impl TokenRow {
    pub fn allows_model(&self, model: &str) -> bool {
        self.model_limits.is_empty() || self.model_limits.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopUpStatus {
    Pending,
    Success,
    Expired,
}

impl TopUpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TopUpStatus::Pending => "pending",
            TopUpStatus::Success => "success",
            TopUpStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "success" => TopUpStatus::Success,
            "expired" => TopUpStatus::Expired,
            _ => TopUpStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopUpRow {
    pub id: i64,
    pub user_id: i64,
    pub trade_no: String,
    pub amount: i64,
    pub status: TopUpStatus,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// Everything the relay reads at runtime, loaded in one pass.
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub channels: Vec<Channel>,
    pub abilities: Vec<Ability>,
}
