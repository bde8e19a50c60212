use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use onerelay_protocol::openai::chat::ChatCompletionRequest;
use onerelay_provider_core::{
    Adaptor, AdaptorOutput, CallerInfo, Channel, ChannelType, RelayErrorKind, RelayFormat,
    RelayInfo, RelayMode, RequestMeta, ResponseWriter, header_get,
};
use onerelay_transform::{ImageLoader, LoadedImage, TransformError};

use super::ClaudeAdaptor;

struct NoImages;

#[async_trait::async_trait]
impl ImageLoader for NoImages {
    async fn load(&self, url: &str) -> Result<LoadedImage, TransformError> {
        Err(TransformError::ImageFetch(url.to_string()))
    }
}

fn adaptor() -> ClaudeAdaptor {
    ClaudeAdaptor::new(Arc::new(NoImages))
}

fn info(format: RelayFormat, stream: bool, include_usage: bool) -> RelayInfo {
    let mut channel = Channel::new(11, "anthropic", ChannelType::Anthropic);
    channel
        .settings
        .insert("anthropic_beta".to_string(), json!("prompt-caching-2024-07-31"));
    let caller = CallerInfo {
        user_id: 1,
        token_id: 1,
        token_name: "t".to_string(),
        group: "default".to_string(),
        is_root: false,
        token_unlimited: false,
        accept_unset_ratio_model: false,
    };
    let meta = RequestMeta {
        mode: if format == RelayFormat::Claude {
            RelayMode::ClaudeMessages
        } else {
            RelayMode::ChatCompletions
        },
        format,
        origin_model: "claude-3-7-sonnet-thinking".to_string(),
        is_stream: stream,
        include_usage,
        prompt_tokens: 9,
        max_tokens: 0,
    };
    RelayInfo::new(&caller, &channel, "sk-ant", &meta)
}

fn frame(event: &str, data: Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

fn happy_stream() -> Vec<Bytes> {
    vec![
        frame(
            "message_start",
            json!({"type": "message_start", "message": {
                "id": "msg_1", "type": "message", "role": "assistant",
                "model": "claude-3-7-sonnet", "content": [],
                "usage": {"input_tokens": 50, "output_tokens": 1}
            }}),
        ),
        frame(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        ),
        frame(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
        ),
        frame(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
        ),
        frame(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "!"}}),
        ),
        frame(
            "message_delta",
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 20}}),
        ),
        frame("message_stop", json!({"type": "message_stop"})),
    ]
}

async fn upstream(frames: Vec<Bytes>) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(frames.len().max(1));
    for frame in frames {
        tx.send(frame).await.unwrap();
    }
    rx
}

fn collect(rx: &mut mpsc::Receiver<Bytes>) -> String {
    let mut out = String::new();
    while let Ok(bytes) = rx.try_recv() {
        out.push_str(&String::from_utf8_lossy(&bytes));
    }
    out
}

#[tokio::test]
async fn chat_request_uses_upstream_model_and_thinking() {
    let mut info = info(RelayFormat::OpenAI, true, false);
    let req: ChatCompletionRequest = serde_json::from_value(json!({
        "model": "claude-3-7-sonnet-thinking",
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 2000
    }))
    .unwrap();
    let body = adaptor().convert_chat_request(&mut info, req).await.unwrap();
    let sent: Value = serde_json::from_slice(&body.bytes).unwrap();
    assert_eq!(sent["model"], "claude-3-7-sonnet");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["thinking"]["budget_tokens"], 1600);
    assert_eq!(body.content_type, "application/json");
}

#[tokio::test]
async fn headers_carry_key_version_and_beta() {
    let info = info(RelayFormat::OpenAI, false, false);
    let body = onerelay_provider_core::RequestBody::json(&json!({})).unwrap();
    let req = adaptor().build_request(&info, body).unwrap();
    assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
    assert_eq!(header_get(&req.headers, "x-api-key"), Some("sk-ant"));
    assert_eq!(header_get(&req.headers, "anthropic-version"), Some("2023-06-01"));
    assert_eq!(
        header_get(&req.headers, "anthropic-beta"),
        Some("prompt-caching-2024-07-31")
    );
}

#[tokio::test]
async fn stream_transcodes_and_reports_usage() {
    let mut info = info(RelayFormat::OpenAI, true, true);
    let (mut writer, mut down) = ResponseWriter::channel(RelayFormat::OpenAI, "claude-3-7-sonnet");
    // Large enough for every frame so nothing blocks.
    let rx = upstream(happy_stream()).await;
    let (tx, mut sink) = mpsc::channel(64);
    let forward = tokio::spawn(async move {
        while let Some(bytes) = down.recv().await {
            if tx.send(bytes).await.is_err() {
                break;
            }
        }
    });

    let out = adaptor().handle_stream(&mut info, rx, &mut writer).await.unwrap();
    drop(writer);
    forward.await.unwrap();

    assert!(matches!(out, AdaptorOutput::Stream { truncated: false, .. }));
    let usage = out.usage();
    assert_eq!(usage.prompt_tokens, 50);
    assert_eq!(usage.completion_tokens, 20);
    assert_eq!(usage.total_tokens, 70);

    let text = collect(&mut sink);
    assert!(text.contains("\"content\":\"Hel\""));
    assert!(text.contains("\"finish_reason\":\"stop\""));
    assert!(text.contains("\"total_tokens\":70"));
    assert!(text.trim_end().ends_with("data: [DONE]"));
    assert!(info.has_send_response());
}

#[tokio::test]
async fn cut_off_stream_is_flagged_and_still_billed() {
    let mut info = info(RelayFormat::OpenAI, true, true);
    let (mut writer, mut down) = ResponseWriter::channel(RelayFormat::OpenAI, "claude-3-7-sonnet");
    let mut frames = happy_stream();
    // Upstream goes quiet after the text deltas: no message_delta, no message_stop.
    frames.truncate(5);
    let rx = upstream(frames).await;
    let (tx, mut sink) = mpsc::channel(64);
    let forward = tokio::spawn(async move {
        while let Some(bytes) = down.recv().await {
            let _ = tx.send(bytes).await;
        }
    });

    let out = adaptor().handle_stream(&mut info, rx, &mut writer).await.unwrap();
    drop(writer);
    forward.await.unwrap();

    assert!(matches!(out, AdaptorOutput::Stream { truncated: true, .. }));
    let usage = out.usage();
    assert_eq!(usage.prompt_tokens, 50);
    assert!(usage.completion_tokens > 0);

    let text = collect(&mut sink);
    assert!(text.contains("\"content\":\"!\""));
    assert!(!text.contains("\"finish_reason\":\"stop\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn claude_callers_get_raw_frames() {
    let mut info = info(RelayFormat::Claude, true, false);
    let (mut writer, mut down) = ResponseWriter::channel(RelayFormat::Claude, "claude-3-7-sonnet");
    let rx = upstream(happy_stream()).await;
    let (tx, mut sink) = mpsc::channel(64);
    let forward = tokio::spawn(async move {
        while let Some(bytes) = down.recv().await {
            let _ = tx.send(bytes).await;
        }
    });

    let out = adaptor().handle_stream(&mut info, rx, &mut writer).await.unwrap();
    drop(writer);
    forward.await.unwrap();

    assert_eq!(out.usage().total_tokens, 70);
    let text = collect(&mut sink);
    assert!(text.contains("event: message_start"));
    assert!(text.contains("\"text_delta\""));
    assert!(!text.contains("[DONE]"));
}

#[tokio::test]
async fn error_event_keeps_partial_usage() {
    let mut info = info(RelayFormat::OpenAI, true, false);
    let (mut writer, _down) = ResponseWriter::channel(RelayFormat::OpenAI, "claude-3-7-sonnet");
    let mut frames = happy_stream();
    frames.truncate(3);
    frames.push(frame(
        "error",
        json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
    ));
    let rx = upstream(frames).await;

    // The downstream receiver is held but never drained; the bounded
    // channel has room for the few frames written before the failure.
    let err = adaptor()
        .handle_stream(&mut info, rx, &mut writer)
        .await
        .unwrap_err();
    assert_eq!(err.kind, RelayErrorKind::MidStream);
    assert_eq!(err.error_type, "overloaded_error");
    let usage = err.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 50);
    assert!(usage.completion_tokens > 0);
}

#[tokio::test]
async fn batch_response_becomes_chat_completion() {
    let mut info = info(RelayFormat::OpenAI, false, false);
    let body = json!({
        "id": "msg_2", "type": "message", "role": "assistant", "model": "claude-3-7-sonnet",
        "content": [
            {"type": "thinking", "thinking": "hmm", "signature": "sig"},
            {"type": "text", "text": "Sure."},
            {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {"q": "x"}}
        ],
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 100, "output_tokens": 30, "cache_read_input_tokens": 50}
    });
    let out = adaptor()
        .handle_batch(
            &mut info,
            200,
            "application/json".to_string(),
            Bytes::from(body.to_string()),
        )
        .await
        .unwrap();
    let AdaptorOutput::Batch { body, usage, .. } = out else {
        panic!("expected batch output");
    };
    assert_eq!(usage.prompt_tokens, 150);
    assert_eq!(usage.cached_tokens, 50);
    let chat: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(chat["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(chat["choices"][0]["message"]["reasoning_content"], "hmm");
    assert_eq!(
        chat["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "lookup"
    );
    assert_eq!(chat["usage"]["total_tokens"], 180);
}
