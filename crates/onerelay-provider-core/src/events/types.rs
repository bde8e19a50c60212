use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelStatus;
use crate::relay_info::RelayMode;
use crate::usage::Usage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Consume(ConsumeEvent),
    RelayFailed(RelayFailedEvent),
    ChannelStatus(ChannelStatusEvent),
}

/// A settled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeEvent {
    pub at: SystemTime,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub mode: RelayMode,
    pub is_stream: bool,
    pub usage: Usage,
    pub quota: i64,
    pub use_time_ms: u64,
}

/// A request that failed after exhausting its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFailedEvent {
    pub at: SystemTime,
    pub user_id: i64,
    pub channel_id: Option<i64>,
    pub model: String,
    pub status: u16,
    pub error_type: String,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatusEvent {
    pub at: SystemTime,
    pub channel_id: i64,
    pub channel_name: String,
    pub status: ChannelStatus,
    pub reason: String,
}
