//! Channel auto-disable / auto-enable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use onerelay_common::{KeywordMatcher, RelaySettings};
use onerelay_provider_core::{
    Channel, ChannelStatus, ChannelStatusEvent, ChannelType, Event, RelayError,
};
use onerelay_storage::{Storage, StorageResult};

use crate::state::AppState;

const DISABLING_CODES: &[&str] = &[
    "invalid_api_key",
    "account_deactivated",
    "billing_not_active",
    "pre_consume_token_quota_failed",
];

const DISABLING_TYPES: &[&str] = &[
    "insufficient_quota",
    "insufficient_user_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

/// Whether `err`, raised by a channel of `channel_type`, means the channel is unusable.
pub fn should_disable_channel(
    settings: &RelaySettings,
    keywords: &KeywordMatcher,
    channel_type: ChannelType,
    err: &RelayError,
) -> bool {
    if !settings.automatic_disable_channel || err.is_local() {
        return false;
    }
    if err.status == 401 {
        return true;
    }
    if err.status == 403 && channel_type == ChannelType::Gemini {
        return true;
    }
    if err
        .code
        .as_deref()
        .is_some_and(|code| DISABLING_CODES.contains(&code))
    {
        return true;
    }
    if DISABLING_TYPES.contains(&err.error_type.as_str()) {
        return true;
    }
    keywords.is_match(&err.message.to_lowercase())
}

pub fn should_enable_channel(
    settings: &RelaySettings,
    err: Option<&RelayError>,
    status: ChannelStatus,
) -> bool {
    settings.automatic_enable_channel && err.is_none() && status == ChannelStatus::AutoDisabled
}

pub fn notify_key(channel_id: i64, status: ChannelStatus) -> String {
    format!("channel_update_{}_{}", channel_id, status.as_i32())
}

pub struct HealthManager {
    storage: Arc<dyn Storage>,
    state: Arc<AppState>,
    notified: Mutex<HashMap<String, Instant>>,
}

impl HealthManager {
    pub fn new(storage: Arc<dyn Storage>, state: Arc<AppState>) -> Self {
        Self {
            storage,
            state,
            notified: Mutex::new(HashMap::new()),
        }
    }

    pub async fn disable_channel(&self, id: i64, name: &str, reason: &str) -> StorageResult<()> {
        self.update_status(id, name, ChannelStatus::AutoDisabled, reason)
            .await
    }

    pub async fn enable_channel(&self, id: i64, name: &str, reason: &str) -> StorageResult<()> {
        self.update_status(id, name, ChannelStatus::Enabled, reason)
            .await
    }

    /// Evaluates a failed attempt; a disable runs in the background.
    ///
    /// Returns whether a disable was scheduled.
    pub fn handle_relay_error(self: &Arc<Self>, channel: &Channel, err: &RelayError) -> bool {
        let settings = self.state.settings();
        let keywords = self.state.keywords.load();
        if !channel.auto_ban
            || !should_disable_channel(&settings, &keywords, channel.channel_type, err)
        {
            return false;
        }

        let health = self.clone();
        let (id, name) = (channel.id, channel.name.clone());
        let reason = format!("status {}: {}", err.status, err.message);
        tokio::spawn(async move {
            if let Err(err) = health.disable_channel(id, &name, &reason).await {
                warn!(event = "channel_disable_failed", channel_id = id, error = %err);
            }
        });
        true
    }

    async fn update_status(
        &self,
        id: i64,
        name: &str,
        status: ChannelStatus,
        reason: &str,
    ) -> StorageResult<()> {
        self.storage.set_channel_status(id, status).await?;
        self.state.refresh_channels(self.storage.as_ref()).await?;
        info!(
            event = "channel_status_changed",
            channel_id = id,
            status = ?status,
            reason = %reason
        );

        let window = Duration::from_secs(self.state.global.load().settings.notify_dedup_secs);
        if self.should_notify(&notify_key(id, status), window) {
            self.state
                .events
                .emit(Event::ChannelStatus(ChannelStatusEvent {
                    at: SystemTime::now(),
                    channel_id: id,
                    channel_name: name.to_string(),
                    status,
                    reason: reason.to_string(),
                }))
                .await;
        }
        Ok(())
    }

    /// False when `key` was already sent inside `window`.
    fn should_notify(&self, key: &str, window: Duration) -> bool {
        let mut notified = self
            .notified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        notified.retain(|_, sent| now.duration_since(*sent) < window);
        if notified.contains_key(key) {
            return false;
        }
        notified.insert(key.to_string(), now);
        true
    }
}
