#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use onerelay_common::{GlobalConfig, RelaySettings};
use onerelay_core::{AppState, ChannelTester, HealthManager, QuotaLedger, RelayEngine};
use onerelay_provider_core::{
    Channel, ChannelType, Event, EventHub, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
use onerelay_provider_impl::{HttpImageLoader, builtin_registry};
use onerelay_storage::{NewToken, NewUser, ROLE_COMMON, SeaOrmStorage, Storage};

pub const USER_KEY: &str = "sk-user";
pub const GOOD: &str = "http://good.test";
pub const BROKEN: &str = "http://broken.test";
pub const REVOKED: &str = "http://revoked.test";

/// Canned upstream keyed by base URL.
#[derive(Default)]
pub struct FakeUpstream {
    calls: Mutex<Vec<String>>,
}

impl FakeUpstream {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn chat_completion() -> String {
    json!({
        "id": "chatcmpl-1", "object": "chat.completion", "created": 1, "model": "gpt-4o",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
    })
    .to_string()
}

fn stream_frames() -> Vec<Bytes> {
    let chunk = |delta: serde_json::Value, usage: serde_json::Value| {
        let mut frame = json!({
            "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
            "choices": if delta.is_null() { json!([]) } else { json!([{"index": 0, "delta": delta, "finish_reason": null}]) }
        });
        if !usage.is_null() {
            frame["usage"] = usage;
        }
        Bytes::from(format!("data: {frame}\n\n"))
    };
    vec![
        chunk(json!({"role": "assistant", "content": "Hel"}), serde_json::Value::Null),
        chunk(json!({"content": "lo"}), serde_json::Value::Null),
        chunk(
            serde_json::Value::Null,
            json!({"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}),
        ),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ]
}

impl UpstreamClient for FakeUpstream {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls.lock().unwrap().push(req.url.clone());
            let json_headers = vec![("content-type".to_string(), "application/json".to_string())];
            let (status, body) = if req.url.starts_with(BROKEN) {
                (
                    500,
                    json!({"error": {"message": "upstream exploded", "type": "server_error"}})
                        .to_string(),
                )
            } else if req.url.starts_with(REVOKED) {
                (
                    401,
                    json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "code": "invalid_api_key"}})
                        .to_string(),
                )
            } else if req.is_stream {
                let frames = stream_frames();
                let (tx, rx) = mpsc::channel(frames.len());
                for frame in frames {
                    let _ = tx.send(frame).await;
                }
                return Ok(UpstreamHttpResponse {
                    status: 200,
                    headers: vec![(
                        "content-type".to_string(),
                        "text/event-stream".to_string(),
                    )],
                    body: UpstreamBody::Stream(rx),
                });
            } else {
                (200, chat_completion())
            };
            Ok(UpstreamHttpResponse {
                status,
                headers: json_headers,
                body: UpstreamBody::Bytes(Bytes::from(body)),
            })
        })
    }
}

pub struct Harness {
    pub storage: Arc<dyn Storage>,
    pub state: Arc<AppState>,
    pub engine: Arc<RelayEngine>,
    pub tester: Arc<ChannelTester>,
    pub upstream: Arc<FakeUpstream>,
    pub user_id: i64,
    pub token_id: i64,
}

pub fn channel(name: &str, base_url: &str, priority: i64) -> Channel {
    let mut channel = Channel::new(0, name, ChannelType::OpenAI);
    channel.key = format!("sk-{name}");
    channel.base_url = Some(base_url.to_string());
    channel.models = vec!["gpt-4o".to_string()];
    channel.priority = priority;
    channel
}

pub struct Setup {
    pub settings: RelaySettings,
    pub user_quota: i64,
    pub token_quota: i64,
    pub token_unlimited: bool,
    pub model_limits: Vec<String>,
    pub channels: Vec<Channel>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            settings: RelaySettings::default(),
            user_quota: 1_000_000,
            token_quota: 1_000_000,
            token_unlimited: false,
            model_limits: Vec::new(),
            channels: Vec::new(),
        }
    }
}

pub async fn harness(setup: Setup) -> Harness {
    let seaorm = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
    seaorm.sync().await.unwrap();
    let storage: Arc<dyn Storage> = Arc::new(seaorm);

    let user_id = storage
        .insert_user(&NewUser {
            username: "alice".to_string(),
            group: "default".to_string(),
            quota: setup.user_quota,
            role: ROLE_COMMON,
        })
        .await
        .unwrap();
    let token_id = storage
        .insert_token(&NewToken {
            user_id,
            name: "laptop".to_string(),
            key_hash: blake3::hash(USER_KEY.as_bytes()).to_hex().to_string(),
            remain_quota: setup.token_quota,
            unlimited_quota: setup.token_unlimited,
            model_limits: setup.model_limits,
            group: None,
        })
        .await
        .unwrap();
    for channel in &setup.channels {
        storage.insert_channel(channel).await.unwrap();
    }

    let global = GlobalConfig {
        host: "127.0.0.1".to_string(),
        port: 3000,
        admin_key_hash: String::new(),
        proxy: None,
        dsn: "sqlite::memory:".to_string(),
        log_consume_content: false,
        settings: setup.settings.clone(),
    };
    let snapshot = storage.load_channel_snapshot().await.unwrap();
    let state = Arc::new(AppState::from_bootstrap(global, &snapshot, EventHub::new(64)));

    let upstream = Arc::new(FakeUpstream::default());
    let images = HttpImageLoader::new(Duration::from_secs(1)).unwrap();
    let ledger = Arc::new(QuotaLedger::new(storage.clone(), false));
    let health = Arc::new(HealthManager::new(storage.clone(), state.clone()));
    let engine = Arc::new(RelayEngine::new(
        state.clone(),
        storage.clone(),
        builtin_registry(Arc::new(images)),
        upstream.clone(),
        ledger,
        health,
    ));
    let tester = Arc::new(ChannelTester::new(engine.clone()));

    Harness {
        storage,
        state,
        engine,
        tester,
        upstream,
        user_id,
        token_id,
    }
}

/// Waits for the first event `pick` accepts.
pub async fn wait_for<T>(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    mut pick: impl FnMut(Event) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .unwrap()
}
