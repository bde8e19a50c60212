mod support;

use serde_json::{Value, json};

use onerelay_core::{RelayRequest, RelayResponse};
use onerelay_protocol::openai::chat::ChatCompletionRequest;
use onerelay_provider_core::{ChannelStatus, Event, RelayFormat, RelayMode};

use support::{BROKEN, GOOD, REVOKED, Setup, USER_KEY, channel, harness, wait_for};

fn chat(model: &str, stream: bool) -> RelayRequest {
    let request: ChatCompletionRequest = serde_json::from_value(json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello there"}],
        "max_tokens": 64,
        "stream": stream
    }))
    .unwrap();
    RelayRequest::Chat(request)
}

#[tokio::test]
async fn batch_relay_settles_quota() {
    let h = harness(Setup {
        channels: vec![channel("main", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();

    let response = h.engine.relay(&caller, request, meta).await.unwrap();
    let RelayResponse::Batch { status, body, .. } = response else {
        panic!("expected batch");
    };
    assert_eq!(status, 200);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");

    // (12 prompt + 4 completion × 4) × 1.25
    let user = h.storage.get_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000_000 - 35);
    let token = h.storage.get_token(h.token_id).await.unwrap().unwrap();
    assert_eq!(token.remain_quota, 1_000_000 - 35);
    assert_eq!(h.storage.count_logs(h.user_id).await.unwrap(), 1);
}

#[tokio::test]
async fn unlimited_token_keeps_its_remain_quota() {
    // A small user balance forces a real reservation instead of the trusted path.
    let h = harness(Setup {
        user_quota: 1_000,
        token_quota: 0,
        token_unlimited: true,
        channels: vec![channel("main", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();

    let response = h.engine.relay(&caller, request, meta).await.unwrap();
    assert!(matches!(response, RelayResponse::Batch { status: 200, .. }));

    let user = h.storage.get_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000 - 35);
    let token = h.storage.get_token(h.token_id).await.unwrap().unwrap();
    assert_eq!(token.remain_quota, 0);
    assert_eq!(token.used_quota, 35);
}

#[tokio::test]
async fn failed_tier_falls_back_to_lower_priority() {
    let h = harness(Setup {
        channels: vec![channel("primary", BROKEN, 10), channel("backup", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();

    let response = h.engine.relay(&caller, request, meta).await.unwrap();
    assert!(matches!(response, RelayResponse::Batch { status: 200, .. }));

    let calls = h.upstream.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with(BROKEN));
    assert!(calls[1].starts_with(GOOD));

    // A plain 500 is not a reason to take the channel out.
    let snapshot = h.storage.load_channel_snapshot().await.unwrap();
    assert!(snapshot.channels.iter().all(|c| c.status == ChannelStatus::Enabled));
}

#[tokio::test]
async fn revoked_key_disables_channel() {
    let h = harness(Setup {
        channels: vec![channel("revoked", REVOKED, 10), channel("backup", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let mut events = h.state.events.subscribe();
    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();

    h.engine.relay(&caller, request, meta).await.unwrap();

    let changed = wait_for(&mut events, |event| match event {
        Event::ChannelStatus(change) => Some(change),
        _ => None,
    })
    .await;
    assert_eq!(changed.channel_name, "revoked");
    assert_eq!(changed.status, ChannelStatus::AutoDisabled);

    let stored = h
        .storage
        .get_channel(changed.channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ChannelStatus::AutoDisabled);
    assert_eq!(h.state.channels.load().tier_count("default", "gpt-4o"), 1);
}

#[tokio::test]
async fn stream_relay_settles_after_last_frame() {
    let h = harness(Setup {
        channels: vec![channel("main", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let mut events = h.state.events.subscribe();
    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", true);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();

    let response = h.engine.relay(&caller, request, meta).await.unwrap();
    let RelayResponse::Stream { mut rx } = response else {
        panic!("expected stream");
    };
    let mut out = String::new();
    while let Some(frame) = rx.recv().await {
        out.push_str(&String::from_utf8_lossy(&frame));
    }
    assert!(out.contains("\"content\":\"Hel\""));
    assert!(out.trim_end().ends_with("data: [DONE]"));

    let consumed = wait_for(&mut events, |event| match event {
        Event::Consume(consume) => Some(consume),
        _ => None,
    })
    .await;
    assert!(consumed.is_stream);
    assert_eq!(consumed.usage.prompt_tokens, 12);
    assert_eq!(consumed.usage.completion_tokens, 5);
    assert_eq!(consumed.quota, 40);
}

#[tokio::test]
async fn callers_are_gated_before_any_upstream_call() {
    let h = harness(Setup {
        user_quota: 0,
        model_limits: vec!["gpt-4o-mini".to_string()],
        channels: vec![channel("main", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    assert_eq!(h.engine.authenticate("sk-nope").await.unwrap_err().status, 401);

    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();
    let err = h.engine.relay(&caller, request, meta).await.unwrap_err();
    assert_eq!(err.status, 403);
    assert_eq!(err.code.as_deref(), Some("model_not_allowed"));

    let request = chat("gpt-4o-mini", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();
    let err = h.engine.relay(&caller, request, meta).await.unwrap_err();
    assert_eq!(err.status, 403);
    assert_eq!(err.code.as_deref(), Some("insufficient_user_quota"));
    assert!(h.upstream.calls().is_empty());
}

#[tokio::test]
async fn missing_channel_reports_failure_event() {
    let h = harness(Setup::default()).await;
    let mut events = h.state.events.subscribe();
    let caller = h.engine.authenticate(USER_KEY).await.unwrap();
    let request = chat("gpt-4o", false);
    let meta = request
        .meta(RelayMode::ChatCompletions, RelayFormat::OpenAI)
        .unwrap();

    let err = h.engine.relay(&caller, request, meta).await.unwrap_err();
    assert_eq!(err.status, 503);

    let failed = wait_for(&mut events, |event| match event {
        Event::RelayFailed(failed) => Some(failed),
        _ => None,
    })
    .await;
    assert_eq!(failed.attempts, 0);
    assert_eq!(failed.model, "gpt-4o");

    let user = h.storage.get_user(h.user_id).await.unwrap().unwrap();
    assert_eq!(user.quota, 1_000_000);
}
