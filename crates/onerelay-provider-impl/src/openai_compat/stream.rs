use serde_json::Value;
use tracing::warn;

use onerelay_protocol::openai;
use onerelay_protocol::openai::chat::{ChatCompletionChunk, chunk_object};
use onerelay_protocol::sse::{SseDecoder, SseFrame};
use onerelay_provider_core::{
    AdaptorOutput, ByteStream, RelayError, RelayFormat, RelayInfo, ResponseWriter, Usage,
};

use crate::tokens::fill_missing_usage;
use crate::unix_now;

#[derive(Debug, Default)]
struct StreamTracker {
    id: Option<String>,
    created: i64,
    usage: Option<openai::Usage>,
    usage_forwarded: bool,
    done: bool,
    text: String,
}

impl StreamTracker {
    fn observe(&mut self, chunk: &ChatCompletionChunk) {
        if self.id.is_none() && !chunk.id.is_empty() {
            self.id = Some(chunk.id.clone());
            self.created = chunk.created;
        }
        for choice in &chunk.choices {
            let delta = &choice.delta;
            if let Some(content) = &delta.content {
                self.text.push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning_content {
                self.text.push_str(reasoning);
            }
            for call in delta.tool_calls.iter().flatten() {
                if let Some(function) = &call.function {
                    if let Some(name) = &function.name {
                        self.text.push_str(name);
                    }
                    if let Some(arguments) = &function.arguments {
                        self.text.push_str(arguments);
                    }
                }
            }
        }
        if let Some(usage) = &chunk.usage
            && (usage.prompt_tokens > 0 || usage.completion_tokens > 0)
        {
            self.usage = Some(usage.clone());
        }
    }
}

fn wants_usage_chunk(info: &RelayInfo) -> bool {
    match info.format {
        RelayFormat::OpenAI => info.should_include_usage,
        RelayFormat::Gemini => true,
        RelayFormat::Claude => false,
    }
}

/// Forwards an OpenAI-style SSE stream while tracking usage.
pub(super) async fn relay_stream(
    info: &mut RelayInfo,
    mut rx: ByteStream,
    writer: &mut ResponseWriter,
) -> Result<AdaptorOutput, RelayError> {
    let mut decoder = SseDecoder::new();
    let mut tracker = StreamTracker::default();

    while let Some(bytes) = rx.recv().await {
        for frame in decoder.push(&bytes) {
            forward_frame(&mut tracker, info, writer, frame).await?;
        }
    }
    for frame in decoder.finish() {
        forward_frame(&mut tracker, info, writer, frame).await?;
    }

    let mut usage = tracker
        .usage
        .as_ref()
        .map(Usage::from)
        .unwrap_or_default();
    if usage.completion_tokens == 0 {
        fill_missing_usage(&mut usage, info, &tracker.text);
    }

    if !tracker.usage_forwarded && wants_usage_chunk(info) {
        let chunk = ChatCompletionChunk {
            id: tracker
                .id
                .clone()
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
            object: chunk_object(),
            created: if tracker.created > 0 {
                tracker.created
            } else {
                unix_now()
            },
            model: info.upstream_model.clone(),
            choices: Vec::new(),
            usage: Some(usage.to_openai()),
        };
        writer.write_chunk(info, chunk, None).await?;
    }
    writer.write_done(info).await;
    Ok(AdaptorOutput::Stream {
        usage,
        truncated: !tracker.done,
    })
}

async fn forward_frame(
    tracker: &mut StreamTracker,
    info: &mut RelayInfo,
    writer: &mut ResponseWriter,
    frame: SseFrame,
) -> Result<(), RelayError> {
    if frame.is_done() {
        tracker.done = true;
        return Ok(());
    }
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(());
    }

    let chunk = match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => chunk,
        Err(err) => {
            if let Ok(value) = serde_json::from_str::<Value>(data)
                && value.get("error").is_some()
            {
                let failure = RelayError::from_upstream_body(500, data.as_bytes());
                let mut usage = tracker.usage.as_ref().map(Usage::from).unwrap_or_default();
                fill_missing_usage(&mut usage, info, &tracker.text);
                return Err(RelayError::mid_stream(
                    failure.error_type,
                    failure.message,
                    usage,
                ));
            }
            warn!(
                event = "stream_chunk_undecodable",
                channel_id = info.channel_id,
                error = %err
            );
            if writer.format() == RelayFormat::OpenAI {
                writer.write_raw(info, frame.to_bytes()).await;
            }
            return Ok(());
        }
    };

    tracker.observe(&chunk);
    let usage_only = chunk.choices.is_empty() && chunk.usage.is_some();
    if usage_only {
        if !wants_usage_chunk(info) {
            return Ok(());
        }
        tracker.usage_forwarded = true;
    }
    writer.write_chunk(info, chunk, Some(data)).await?;
    Ok(())
}
