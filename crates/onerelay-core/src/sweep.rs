//! Channel probes: one on demand, or a sequential sweep over every channel.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use onerelay_protocol::openai::chat::{ChatCompletionRequest, ChatMessage};
use onerelay_protocol::openai::embeddings::EmbeddingRequest;
use onerelay_provider_core::{
    CallerInfo, Channel, ChannelStatus, RelayError, RelayFormat, RelayInfo, RelayMode,
    RequestMeta, ResponseWriter,
};

use crate::health::{HealthManager, should_disable_channel, should_enable_channel};
use crate::relay::{RelayEngine, RelayRequest, storage_error};

const FALLBACK_TEST_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("channel test is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub channel_id: i64,
    pub model: String,
    pub elapsed: Duration,
    pub error: Option<RelayError>,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Holds the single sweep slot; dropping it frees the slot even if the sweep panicked.
struct SweepSlot {
    flag: Arc<Mutex<bool>>,
}

impl SweepSlot {
    fn acquire(flag: &Arc<Mutex<bool>>) -> Option<Self> {
        let mut running = lock_flag(flag);
        if *running {
            return None;
        }
        *running = true;
        Some(Self { flag: flag.clone() })
    }
}

impl Drop for SweepSlot {
    fn drop(&mut self) {
        *lock_flag(&self.flag) = false;
    }
}

fn lock_flag(flag: &Mutex<bool>) -> std::sync::MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ChannelTester {
    engine: Arc<RelayEngine>,
    health: Arc<HealthManager>,
    running: Arc<Mutex<bool>>,
}

impl ChannelTester {
    pub fn new(engine: Arc<RelayEngine>) -> Self {
        Self {
            health: engine.health().clone(),
            engine,
            running: Arc::new(Mutex::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        *lock_flag(&self.running)
    }

    /// Probes one channel and records its response time.
    pub async fn test_channel(
        &self,
        id: i64,
        model: Option<&str>,
    ) -> Result<ProbeOutcome, RelayError> {
        let channel = self
            .engine
            .storage()
            .get_channel(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| {
                RelayError::local(404, "channel_not_found", format!("channel {id} not found"))
            })?;
        Ok(self.probe(&channel, model).await)
    }

    /// Starts a sweep in the background; a second call while one runs is refused.
    pub fn test_all_channels(
        self: &Arc<Self>,
        notify: bool,
    ) -> Result<JoinHandle<()>, SweepError> {
        let slot = SweepSlot::acquire(&self.running).ok_or(SweepError::AlreadyRunning)?;
        let tester = self.clone();
        Ok(tokio::spawn(async move {
            let _slot = slot;
            let started = Instant::now();
            let tested = tester.sweep().await;
            if notify {
                info!(
                    event = "channel_sweep_finished",
                    channels = tested,
                    elapsed_ms = started.elapsed().as_millis() as u64
                );
            }
        }))
    }

    /// Scheduled sweep; a zero frequency idles and re-reads the setting every minute.
    pub fn spawn_auto_test(self: &Arc<Self>) -> JoinHandle<()> {
        let tester = self.clone();
        tokio::spawn(async move {
            loop {
                let minutes = tester
                    .engine
                    .state()
                    .global
                    .load()
                    .settings
                    .auto_test_frequency_minutes;
                if minutes == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    continue;
                }
                tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
                match tester.test_all_channels(false) {
                    Ok(handle) => {
                        if let Err(err) = handle.await {
                            warn!(event = "channel_sweep_panicked", error = %err);
                        }
                    }
                    Err(err) => debug!(event = "channel_auto_test_skipped", error = %err),
                }
            }
        })
    }

    async fn sweep(&self) -> usize {
        let channels = match self.engine.storage().load_channel_snapshot().await {
            Ok(snapshot) => snapshot.channels,
            Err(err) => {
                warn!(event = "channel_sweep_load_failed", error = %err);
                return 0;
            }
        };

        let total = channels.len();
        for channel in channels {
            let settings = self.engine.state().settings();
            let outcome = self.probe(&channel, None).await;

            let threshold = settings.channel_disable_threshold_secs;
            let too_slow = threshold > 0.0 && outcome.elapsed.as_secs_f64() > threshold;
            let broken = outcome.error.as_ref().is_some_and(|err| {
                let keywords = self.engine.state().keywords.load();
                should_disable_channel(&settings, &keywords, channel.channel_type, err)
            });
            let ban = (too_slow || broken) && channel.auto_ban;

            if channel.status == ChannelStatus::Enabled && ban {
                let reason = match &outcome.error {
                    Some(err) => format!("probe failed: {}", err.message),
                    None => format!(
                        "probe took {:.2}s, over the {threshold:.2}s threshold",
                        outcome.elapsed.as_secs_f64()
                    ),
                };
                if let Err(err) = self
                    .health
                    .disable_channel(channel.id, &channel.name, &reason)
                    .await
                {
                    warn!(event = "channel_disable_failed", channel_id = channel.id, error = %err);
                }
            } else if should_enable_channel(&settings, outcome.error.as_ref(), channel.status)
                && !too_slow
            {
                if let Err(err) = self
                    .health
                    .enable_channel(channel.id, &channel.name, "probe succeeded")
                    .await
                {
                    warn!(event = "channel_enable_failed", channel_id = channel.id, error = %err);
                }
            }

            if settings.request_interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(settings.request_interval_ms)).await;
            }
        }
        total
    }

    async fn probe(&self, channel: &Channel, model: Option<&str>) -> ProbeOutcome {
        let model = model
            .map(str::to_string)
            .or_else(|| channel.test_model.clone().filter(|m| !m.trim().is_empty()))
            .or_else(|| channel.model_list().into_iter().next())
            .unwrap_or_else(|| FALLBACK_TEST_MODEL.to_string());

        let started = Instant::now();
        let error = self.probe_once(channel, &model).await.err();
        let elapsed = started.elapsed();

        let tested_at = OffsetDateTime::now_utc().unix_timestamp();
        if let Err(err) = self
            .engine
            .storage()
            .record_channel_test(channel.id, elapsed.as_millis() as i64, tested_at)
            .await
        {
            warn!(event = "channel_test_record_failed", channel_id = channel.id, error = %err);
        }
        info!(
            event = "channel_probed",
            channel_id = channel.id,
            model = %model,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = error.is_none()
        );
        ProbeOutcome {
            channel_id: channel.id,
            model,
            elapsed,
            error,
        }
    }

    async fn probe_once(&self, channel: &Channel, model: &str) -> Result<(), RelayError> {
        let (request, mode) = probe_request(model);
        let meta = request.meta(mode, RelayFormat::OpenAI)?;
        let adaptor = self
            .engine
            .registry()
            .get(channel.channel_type)
            .ok_or_else(|| {
                RelayError::config(
                    "channel_type_unsupported",
                    format!("no adaptor for channel type {}", channel.channel_type),
                )
            })?;

        let caller = CallerInfo {
            user_id: 0,
            token_id: 0,
            token_name: "channel-test".to_string(),
            group: channel
                .group_list()
                .into_iter()
                .next()
                .unwrap_or_else(|| "default".to_string()),
            is_root: true,
            token_unlimited: true,
            accept_unset_ratio_model: true,
        };
        let key = channel.keys().first().map(|key| key.to_string()).unwrap_or_default();
        let mut info = RelayInfo::new(&caller, channel, &key, &meta);
        adaptor.init(&mut info);

        let body = request.convert(adaptor.as_ref(), &mut info).await?;
        let upstream_req = adaptor.build_request(&info, body)?;
        let resp = adaptor
            .do_request(self.engine.client().as_ref(), upstream_req)
            .await?;
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.into_bytes().await;
            return Err(RelayError::from_upstream_body(status, &body));
        }
        let (mut writer, _rx) = ResponseWriter::channel(meta.format, &meta.origin_model);
        adaptor.do_response(&mut info, resp, &mut writer).await?;
        Ok(())
    }
}

fn is_embedding_model(model: &str) -> bool {
    model.contains("embedding") || model.starts_with("m3e") || model.contains("bge-")
}

/// The smallest request that proves the channel answers for `model`.
fn probe_request(model: &str) -> (RelayRequest, RelayMode) {
    if is_embedding_model(model) {
        return (
            RelayRequest::Embedding(EmbeddingRequest {
                model: model.to_string(),
                input: json!("hello world"),
                encoding_format: None,
                dimensions: None,
                extra: Default::default(),
            }),
            RelayMode::Embeddings,
        );
    }

    let mut request = ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::text("user", "hi")],
        ..Default::default()
    };
    if model.starts_with('o') {
        request.max_completion_tokens = Some(10);
    } else {
        request.max_tokens = Some(10);
    }
    (RelayRequest::Chat(request), RelayMode::ChatCompletions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_shape_follows_model() {
        let (request, mode) = probe_request("text-embedding-3-small");
        assert_eq!(mode, RelayMode::Embeddings);
        assert!(matches!(request, RelayRequest::Embedding(_)));

        let (request, mode) = probe_request("o3-mini");
        assert_eq!(mode, RelayMode::ChatCompletions);
        let RelayRequest::Chat(chat) = request else {
            panic!("expected chat");
        };
        assert_eq!(chat.max_completion_tokens, Some(10));
        assert_eq!(chat.max_tokens, None);

        let (request, _) = probe_request("gpt-4o");
        let RelayRequest::Chat(chat) = request else {
            panic!("expected chat");
        };
        assert_eq!(chat.max_tokens, Some(10));
        assert_eq!(chat.messages[0].text_content(), "hi");
    }

    #[tokio::test]
    async fn panicking_sweep_frees_the_slot() {
        let flag = Arc::new(Mutex::new(false));
        let slot = SweepSlot::acquire(&flag).unwrap();
        assert!(SweepSlot::acquire(&flag).is_none());

        let handle = tokio::spawn(async move {
            let _slot = slot;
            panic!("sweep blew up");
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert!(!*lock_flag(&flag));

        let again = SweepSlot::acquire(&flag);
        assert!(again.is_some());
        drop(again);
        assert!(!*lock_flag(&flag));
    }
}
