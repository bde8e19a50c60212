//! The relay loop: pick a channel, convert, send, translate, settle.

mod request;

pub use request::RelayRequest;

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use rand::seq::IndexedRandom;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use onerelay_protocol::sse;
use onerelay_provider_core::{
    AdaptorOutput, AdaptorRegistry, CallerInfo, Channel, ConsumeEvent, Event, PriceData,
    RelayError, RelayFailedEvent, RelayFormat, RelayInfo, RequestMeta, ResponseWriter,
    UpstreamBody, UpstreamClient, Usage,
};
use onerelay_storage::{LogKind, LogRecord, QuotaField, Storage, StorageError};
use onerelay_transform::openai2claude::request::ClaudeConvertOptions;

use crate::health::HealthManager;
use crate::ledger::QuotaLedger;
use crate::pricing::{describe, model_price_data, settle_quota};
use crate::state::AppState;

/// Callers holding more than this many times the estimate skip pre-consumption.
const TRUST_MULTIPLIER: i64 = 100;

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller {
    pub info: CallerInfo,
    /// Empty means every model.
    pub model_limits: Vec<String>,
}

impl Caller {
    pub fn allows_model(&self, model: &str) -> bool {
        self.model_limits.is_empty() || self.model_limits.iter().any(|m| m == model)
    }
}

#[derive(Debug)]
pub enum RelayResponse {
    Batch {
        status: u16,
        content_type: String,
        body: Bytes,
    },
    /// SSE frames already encoded in the caller's wire family.
    Stream { rx: mpsc::Receiver<Bytes> },
}

pub struct RelayEngine {
    state: Arc<AppState>,
    storage: Arc<dyn Storage>,
    registry: AdaptorRegistry,
    client: Arc<dyn UpstreamClient>,
    ledger: Arc<QuotaLedger>,
    health: Arc<HealthManager>,
}

impl RelayEngine {
    pub fn new(
        state: Arc<AppState>,
        storage: Arc<dyn Storage>,
        registry: AdaptorRegistry,
        client: Arc<dyn UpstreamClient>,
        ledger: Arc<QuotaLedger>,
        health: Arc<HealthManager>,
    ) -> Self {
        Self {
            state,
            storage,
            registry,
            client,
            ledger,
            health,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &AdaptorRegistry {
        &self.registry
    }

    pub fn client(&self) -> &Arc<dyn UpstreamClient> {
        &self.client
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    /// Resolves a caller key (plaintext) to its token and owner.
    pub async fn authenticate(&self, key: &str) -> Result<Caller, RelayError> {
        let key_hash = blake3::hash(key.as_bytes()).to_hex().to_string();
        let token = self
            .storage
            .find_token_by_key_hash(&key_hash)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| RelayError::local(401, "invalid_api_key", "invalid token"))?;
        if !token.enabled {
            return Err(RelayError::local(401, "token_disabled", "token is disabled"));
        }
        let user = self
            .storage
            .get_user(token.user_id)
            .await
            .map_err(storage_error)?
            .filter(|user| user.enabled)
            .ok_or_else(|| RelayError::local(403, "user_disabled", "user is disabled"))?;

        let group = token
            .group
            .clone()
            .filter(|group| !group.trim().is_empty())
            .unwrap_or_else(|| user.group.clone());
        Ok(Caller {
            info: CallerInfo {
                user_id: user.id,
                token_id: token.id,
                token_name: token.name.clone(),
                group,
                is_root: user.is_root(),
                token_unlimited: token.unlimited_quota,
                accept_unset_ratio_model: false,
            },
            model_limits: token.model_limits,
        })
    }

    /// Models the caller's group can reach.
    pub fn models(&self, caller: &Caller) -> Vec<String> {
        self.state
            .channels
            .load()
            .enabled_models(&caller.info.group)
            .into_iter()
            .filter(|model| caller.allows_model(model))
            .collect()
    }

    pub async fn relay(
        self: &Arc<Self>,
        caller: &Caller,
        request: RelayRequest,
        meta: RequestMeta,
    ) -> Result<RelayResponse, RelayError> {
        let model = meta.origin_model.clone();
        if !caller.allows_model(&model) {
            return Err(RelayError::local(
                403,
                "model_not_allowed",
                format!("token has no access to model {model}"),
            ));
        }
        let request = self.preflight(request).await?;

        let settings = self.state.settings();
        let mut price = model_price_data(
            &settings,
            &caller.info,
            &model,
            meta.prompt_tokens,
            meta.max_tokens,
        )?;
        price.pre_consumed_quota = self.pre_consume(caller, price.pre_consumed_quota).await?;

        let mut last_err: Option<RelayError> = None;
        let mut last_channel = None;
        let mut attempts = 0;
        for attempt in 0..=settings.retry_times {
            let picked = {
                let index = self.state.channels.load();
                index.select_channel(&caller.info.group, &model, attempt, &mut rand::rng())
            };
            let channel = match picked {
                Ok(channel) => channel,
                Err(err) => {
                    if last_err.is_none() {
                        last_err = Some(err.into());
                    }
                    break;
                }
            };

            attempts += 1;
            last_channel = Some(channel.id);
            match self
                .try_channel(caller, &channel, &request, &meta, price, attempt)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(
                        event = "relay_attempt_failed",
                        channel_id = channel.id,
                        model = %model,
                        attempt,
                        status = err.status,
                        error = %err.message
                    );
                    if !err.is_local() {
                        self.health.handle_relay_error(&channel, &err);
                    }
                    let retry = should_retry(&err);
                    last_err = Some(err);
                    if !retry {
                        break;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            RelayError::local(503, "model_not_found", format!("no available channel for {model}"))
        });
        self.refund(caller, price.pre_consumed_quota).await;
        self.state
            .events
            .emit(Event::RelayFailed(RelayFailedEvent {
                at: SystemTime::now(),
                user_id: caller.info.user_id,
                channel_id: last_channel,
                model,
                status: err.status,
                error_type: err.error_type.clone(),
                message: err.message.clone(),
                attempts,
            }))
            .await;
        Err(err)
    }

    async fn try_channel(
        self: &Arc<Self>,
        caller: &Caller,
        channel: &Arc<Channel>,
        request: &RelayRequest,
        meta: &RequestMeta,
        price: PriceData,
        attempt: u32,
    ) -> Result<RelayResponse, RelayError> {
        let adaptor = self.registry.get(channel.channel_type).ok_or_else(|| {
            RelayError::config(
                "channel_type_unsupported",
                format!("no adaptor for channel type {}", channel.channel_type),
            )
        })?;
        let key = channel
            .keys()
            .choose(&mut rand::rng())
            .map(|key| key.to_string())
            .unwrap_or_default();

        let settings = self.state.settings();
        let mut info = RelayInfo::new(&caller.info, channel, &key, meta);
        info.price = price;
        info.retry_index = attempt;
        info.claude_options = ClaudeConvertOptions {
            default_max_tokens: settings.default_max_tokens,
            thinking_budget_percentage: settings.thinking_budget_percentage,
        };
        adaptor.init(&mut info);

        let body = request.clone().convert(adaptor.as_ref(), &mut info).await?;
        let upstream_req = adaptor.build_request(&info, body)?;
        info!(
            event = "relay_attempt",
            channel_id = channel.id,
            model = %info.upstream_model,
            attempt,
            stream = info.is_stream
        );

        let resp = adaptor.do_request(self.client.as_ref(), upstream_req).await?;
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.into_bytes().await;
            return Err(RelayError::from_upstream_body(status, &body));
        }

        let (mut writer, rx) = ResponseWriter::channel(meta.format, &meta.origin_model);
        if matches!(resp.body, UpstreamBody::Stream(_)) {
            let engine = self.clone();
            let caller = caller.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let usage = match adaptor.do_response(&mut info, resp, &mut writer).await {
                    Ok(output) => {
                        if matches!(output, AdaptorOutput::Stream { truncated: true, .. }) {
                            warn!(
                                event = "relay_stream_truncated",
                                channel_id = channel.id,
                                model = %info.origin_model
                            );
                        }
                        output.usage()
                    }
                    Err(err) => {
                        warn!(
                            event = "relay_stream_failed",
                            channel_id = channel.id,
                            model = %info.origin_model,
                            error = %err.message
                        );
                        let frame = error_frame(&err, writer.format());
                        writer.write_raw(&mut info, frame).await;
                        if !err.is_local() {
                            engine.health.handle_relay_error(&channel, &err);
                        }
                        err.usage.unwrap_or_default()
                    }
                };
                drop(writer);
                engine.settle(&caller, &info, usage).await;
            });
            return Ok(RelayResponse::Stream { rx });
        }

        match adaptor.do_response(&mut info, resp, &mut writer).await? {
            AdaptorOutput::Batch {
                status,
                content_type,
                body,
                usage,
            } => {
                self.settle(caller, &info, usage).await;
                Ok(RelayResponse::Batch {
                    status,
                    content_type,
                    body,
                })
            }
            AdaptorOutput::Stream { .. } => Err(RelayError::local(
                500,
                "bad_response",
                "adaptor streamed a batch response",
            )),
        }
    }

    /// Sensitive-word check on its own blocking thread and deadline; failures reject.
    async fn preflight(&self, request: RelayRequest) -> Result<RelayRequest, RelayError> {
        let filter = self.state.filter.load_full();
        if !filter.is_active() {
            return Ok(request);
        }
        let deadline = filter.timeout();
        let task = tokio::task::spawn_blocking(move || {
            let mut request = request;
            request.apply_filter(&filter)?;
            Ok::<_, RelayError>(request)
        });
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(RelayError::local(
                500,
                "sensitive_check_failed",
                err.to_string(),
            )),
            Err(_) => Err(RelayError::local(
                503,
                "sensitive_check_timeout",
                "sensitive word check timed out",
            )),
        }
    }

    /// Reserves the estimate; returns the amount actually reserved.
    async fn pre_consume(&self, caller: &Caller, estimate: i64) -> Result<i64, RelayError> {
        let user_id = caller.info.user_id;
        let token_id = caller.info.token_id;
        let user = self
            .storage
            .get_user(user_id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| RelayError::local(403, "user_disabled", "user not found"))?;
        let user_quota = user.quota - self.ledger.pending_delta(QuotaField::UserQuota, user_id);
        if user_quota <= 0 {
            return Err(RelayError::local(
                403,
                "insufficient_user_quota",
                "user quota is exhausted",
            ));
        }

        let token_quota = if caller.info.token_unlimited {
            None
        } else {
            let token = self
                .storage
                .get_token(token_id)
                .await
                .map_err(storage_error)?
                .ok_or_else(|| RelayError::local(401, "invalid_api_key", "token not found"))?;
            let remain =
                token.remain_quota - self.ledger.pending_delta(QuotaField::TokenQuota, token_id);
            if remain < estimate {
                return Err(RelayError::local(
                    403,
                    "pre_consume_token_quota_failed",
                    format!("token quota is not enough, remain {remain}, need {estimate}"),
                ));
            }
            Some(remain)
        };
        if user_quota < estimate {
            return Err(RelayError::local(
                403,
                "insufficient_user_quota",
                format!("user quota is not enough, remain {user_quota}, need {estimate}"),
            ));
        }

        let trusted = user_quota > TRUST_MULTIPLIER * estimate
            && token_quota.is_none_or(|remain| remain > TRUST_MULTIPLIER * estimate);
        if trusted || estimate <= 0 {
            return Ok(0);
        }

        self.ledger
            .apply(QuotaField::UserQuota, user_id, estimate)
            .await
            .map_err(storage_error)?;
        if !caller.info.token_unlimited {
            self.ledger
                .apply(QuotaField::TokenQuota, token_id, estimate)
                .await
                .map_err(storage_error)?;
        }
        Ok(estimate)
    }

    async fn refund(&self, caller: &Caller, reserved: i64) {
        if reserved == 0 {
            return;
        }
        let mut holds = vec![(QuotaField::UserQuota, caller.info.user_id)];
        if !caller.info.token_unlimited {
            holds.push((QuotaField::TokenQuota, caller.info.token_id));
        }
        for (field, id) in holds {
            if let Err(err) = self.ledger.apply(field, id, -reserved).await {
                warn!(event = "quota_refund_failed", ?field, id, error = %err);
            }
        }
    }

    /// Charges the real cost, correcting the reservation.
    async fn settle(&self, caller: &Caller, info: &RelayInfo, usage: Usage) {
        let quota_per_unit = self.state.global.load().settings.quota_per_unit;
        let quota = settle_quota(&info.price, &usage, quota_per_unit);
        let delta = quota - info.price.pre_consumed_quota;
        let use_time_ms = info.start_time.elapsed().as_millis() as u64;

        // Unlimited tokens were never reserved against, so only their usage moves.
        let token_move = if caller.info.token_unlimited {
            (QuotaField::TokenUsedQuota, caller.info.token_id, quota)
        } else {
            (QuotaField::TokenQuota, caller.info.token_id, delta)
        };
        let moves = [
            (QuotaField::UserQuota, caller.info.user_id, delta),
            token_move,
            (QuotaField::UserUsedQuota, caller.info.user_id, quota),
            (QuotaField::UserRequestCount, caller.info.user_id, 1),
            (QuotaField::ChannelUsedQuota, info.channel_id, quota),
        ];
        for (field, id, amount) in moves {
            if let Err(err) = self.ledger.apply(field, id, amount).await {
                warn!(event = "quota_settle_failed", ?field, id, amount, error = %err);
            }
        }

        let record = LogRecord {
            created_at: OffsetDateTime::now_utc(),
            kind: LogKind::Consume,
            user_id: caller.info.user_id,
            token_id: caller.info.token_id,
            channel_id: info.channel_id,
            model_name: info.origin_model.clone(),
            group: info.group.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota,
            use_time_ms: use_time_ms as i64,
            is_stream: info.is_stream,
            content: describe(&info.price),
        };
        if let Err(err) = self.storage.append_log(&record).await {
            warn!(event = "consume_log_failed", user_id = caller.info.user_id, error = %err);
        }

        info!(
            event = "relay_settled",
            user_id = caller.info.user_id,
            channel_id = info.channel_id,
            model = %info.origin_model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            quota,
            use_time_ms
        );
        self.state
            .events
            .emit(Event::Consume(ConsumeEvent {
                at: SystemTime::now(),
                user_id: caller.info.user_id,
                token_id: caller.info.token_id,
                channel_id: info.channel_id,
                model: info.origin_model.clone(),
                mode: info.mode,
                is_stream: info.is_stream,
                usage,
                quota,
                use_time_ms,
            }))
            .await;
    }
}

/// Upstream failures retry, except for caller-side statuses and gateway timeouts.
fn should_retry(err: &RelayError) -> bool {
    err.is_retryable() && !matches!(err.status, 400 | 408 | 504 | 524)
}

fn error_frame(err: &RelayError, format: RelayFormat) -> Bytes {
    match format {
        RelayFormat::Claude => {
            let body = err.to_json_bytes(true);
            sse::encode_frame(Some("error"), &String::from_utf8_lossy(&body))
        }
        RelayFormat::OpenAI | RelayFormat::Gemini => {
            let body = err.to_json_bytes(false);
            sse::encode_frame(None, &String::from_utf8_lossy(&body))
        }
    }
}

pub(crate) fn storage_error(err: StorageError) -> RelayError {
    RelayError::local(500, "storage_error", err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_skips_caller_side_statuses() {
        let upstream = |status| RelayError::upstream(status, None, "upstream_error", "x");
        assert!(should_retry(&upstream(429)));
        assert!(should_retry(&upstream(502)));
        assert!(!should_retry(&upstream(400)));
        assert!(!should_retry(&upstream(504)));
        assert!(!should_retry(&RelayError::local(503, "model_not_found", "x")));
    }

    #[test]
    fn stream_error_frames_follow_caller_format() {
        let err = RelayError::upstream(500, None, "overloaded_error", "busy");
        let claude = String::from_utf8(error_frame(&err, RelayFormat::Claude).to_vec()).unwrap();
        assert!(claude.starts_with("event: error\ndata: "));
        assert!(claude.contains("overloaded_error"));
        let openai = String::from_utf8(error_frame(&err, RelayFormat::OpenAI).to_vec()).unwrap();
        assert!(openai.starts_with("data: {\"error\""));
    }

    #[test]
    fn model_limits_gate_access() {
        let caller = Caller {
            info: CallerInfo {
                user_id: 1,
                token_id: 1,
                token_name: "t".to_string(),
                group: "default".to_string(),
                is_root: false,
                token_unlimited: true,
                accept_unset_ratio_model: false,
            },
            model_limits: vec!["gpt-4o".to_string()],
        };
        assert!(caller.allows_model("gpt-4o"));
        assert!(!caller.allows_model("gpt-4.1"));
    }
}
