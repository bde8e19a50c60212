use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::warn;

use onerelay_provider_core::{Event, EventSink};

use crate::storage::{LogKind, LogRecord, Storage};

/// Persists failures and channel status changes as log rows.
///
/// Consume events are skipped: settlement already wrote their record.
pub struct DbEventSink<S: Storage + ?Sized> {
    storage: Arc<S>,
}

impl<S: Storage + ?Sized> DbEventSink<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

pub fn log_record_for(event: &Event) -> Option<LogRecord> {
    match event {
        Event::Consume(_) => None,
        Event::RelayFailed(ev) => Some(LogRecord {
            created_at: OffsetDateTime::from(ev.at),
            kind: LogKind::Error,
            user_id: ev.user_id,
            token_id: 0,
            channel_id: ev.channel_id.unwrap_or(0),
            model_name: ev.model.clone(),
            group: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            quota: 0,
            use_time_ms: 0,
            is_stream: false,
            content: format!(
                "{}: {} (status {}, attempts {})",
                ev.error_type, ev.message, ev.status, ev.attempts
            ),
        }),
        Event::ChannelStatus(ev) => Some(LogRecord {
            created_at: OffsetDateTime::from(ev.at),
            kind: LogKind::System,
            user_id: 0,
            token_id: 0,
            channel_id: ev.channel_id,
            model_name: String::new(),
            group: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            quota: 0,
            use_time_ms: 0,
            is_stream: false,
            content: format!(
                "channel \"{}\" (#{}) moved to {:?}: {}",
                ev.channel_name, ev.channel_id, ev.status, ev.reason
            ),
        }),
    }
}

impl<S: Storage + ?Sized> EventSink for DbEventSink<S> {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(record) = log_record_for(event) else {
                return;
            };
            if let Err(err) = self.storage.append_log(&record).await {
                warn!(event = "event_persist_failed", error = %err);
            }
        })
    }
}
