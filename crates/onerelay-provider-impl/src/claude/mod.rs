//! Anthropic Messages adaptor.
//!
//! OpenAI-shaped callers are converted to Messages and back; Claude-shaped
//! callers are passed through with usage still read from the frames.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use onerelay_protocol::claude::messages::{CreateMessageRequest, MessageResponse};
use onerelay_protocol::openai::chat::ChatCompletionRequest;
use onerelay_protocol::sse::{SseDecoder, SseFrame};
use onerelay_provider_core::{
    Adaptor, AdaptorOutput, ByteStream, Headers, ProviderResult, RelayError, RelayFormat,
    RelayInfo, RequestBody, ResponseWriter, Usage, encode_batch, header_set,
};
use onerelay_transform::ImageLoader;
use onerelay_transform::claude2openai::response::{transform_response, usage_from_claude};
use onerelay_transform::claude2openai::stream::{ClaudeStreamState, StreamOutput};
use onerelay_transform::openai2claude::request::transform_request;

use crate::tokens::fill_missing_usage;
use crate::unix_now;

pub const ADAPTOR_NAME: &str = "claude";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const HEADER_API_KEY: &str = "x-api-key";
const HEADER_VERSION: &str = "anthropic-version";
const HEADER_BETA: &str = "anthropic-beta";

pub struct ClaudeAdaptor {
    images: Arc<dyn ImageLoader>,
}

impl ClaudeAdaptor {
    pub fn new(images: Arc<dyn ImageLoader>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl Adaptor for ClaudeAdaptor {
    fn name(&self) -> &'static str {
        ADAPTOR_NAME
    }

    async fn convert_chat_request(
        &self,
        info: &mut RelayInfo,
        mut req: ChatCompletionRequest,
    ) -> ProviderResult<RequestBody> {
        req.model = info.upstream_model.clone();
        let mut claude = transform_request(&req, &info.claude_options, self.images.as_ref()).await?;
        if info.is_stream {
            claude.stream = Some(true);
        }
        RequestBody::json_with_override(&claude, &info.param_override)
    }

    async fn convert_claude_request(
        &self,
        info: &mut RelayInfo,
        mut req: CreateMessageRequest,
    ) -> ProviderResult<RequestBody> {
        req.model = info.upstream_model.clone();
        RequestBody::json_with_override(&req, &info.param_override)
    }

    fn build_request_url(&self, info: &RelayInfo) -> ProviderResult<String> {
        Ok(format!("{}/v1/messages", info.base_url))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut Headers) -> ProviderResult<()> {
        header_set(headers, HEADER_API_KEY, info.api_key.clone());
        let version = info
            .channel_setting_str("anthropic_version")
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
        header_set(headers, HEADER_VERSION, version);
        if let Some(beta) = info.channel_setting_str("anthropic_beta") {
            header_set(headers, HEADER_BETA, beta);
        }
        Ok(())
    }

    async fn handle_batch(
        &self,
        info: &mut RelayInfo,
        status: u16,
        content_type: String,
        body: Bytes,
    ) -> Result<AdaptorOutput, RelayError> {
        let response: MessageResponse = serde_json::from_slice(&body).map_err(|err| {
            RelayError::upstream(
                500,
                Some("bad_response_body".to_string()),
                "upstream_error",
                format!("unmarshal claude response failed: {err}"),
            )
        })?;

        let mut usage = Usage::from(&usage_from_claude(&response.usage));
        let text = response
            .content
            .iter()
            .filter_map(|block| block.as_text())
            .collect::<Vec<_>>()
            .join("");
        fill_missing_usage(&mut usage, info, &text);

        if info.format == RelayFormat::Claude {
            return Ok(AdaptorOutput::Batch {
                status,
                content_type,
                body,
                usage,
            });
        }

        let mut chat = transform_response(response, unix_now());
        chat.usage = Some(usage.to_openai());
        let body = encode_batch(info.format, chat)?;
        Ok(AdaptorOutput::Batch {
            status,
            content_type: "application/json".to_string(),
            body,
            usage,
        })
    }

    async fn handle_stream(
        &self,
        info: &mut RelayInfo,
        mut rx: ByteStream,
        writer: &mut ResponseWriter,
    ) -> Result<AdaptorOutput, RelayError> {
        let mut decoder = SseDecoder::new();
        let mut state = ClaudeStreamState::new(
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            info.upstream_model.clone(),
            unix_now(),
        );

        let mut stopped = false;
        while let Some(chunk) = rx.recv().await {
            for frame in decoder.push(&chunk) {
                if forward_frame(&mut state, info, writer, frame).await? {
                    stopped = true;
                }
            }
        }
        for frame in decoder.finish() {
            if forward_frame(&mut state, info, writer, frame).await? {
                stopped = true;
            }
        }
        if !stopped {
            warn!(
                event = "claude_stream_truncated",
                channel_id = info.channel_id,
                model = %info.upstream_model
            );
        }

        info.last_message_type = state.last_message_type();
        let mut usage = Usage::from(&state.usage());
        fill_missing_usage(&mut usage, info, state.response_text());

        let wants_usage_chunk = match info.format {
            RelayFormat::OpenAI => info.should_include_usage,
            RelayFormat::Gemini => true,
            RelayFormat::Claude => false,
        };
        if wants_usage_chunk {
            writer
                .write_chunk(info, state.usage_chunk(usage.to_openai()), None)
                .await?;
        }
        writer.write_done(info).await;
        Ok(AdaptorOutput::Stream {
            usage,
            truncated: !stopped,
        })
    }
}

/// Returns `true` once `message_stop` was seen.
async fn forward_frame(
    state: &mut ClaudeStreamState,
    info: &mut RelayInfo,
    writer: &mut ResponseWriter,
    frame: SseFrame,
) -> Result<bool, RelayError> {
    if frame.data.trim().is_empty() {
        return Ok(false);
    }
    let output = state.handle_data(&frame.data);
    let passthrough = writer.format() == RelayFormat::Claude;
    if passthrough {
        writer.write_raw(info, frame.to_bytes()).await;
    }

    match output {
        StreamOutput::Chunk(chunk) if !passthrough => {
            writer.write_chunk(info, chunk, None).await?;
            Ok(false)
        }
        StreamOutput::Chunk(_) | StreamOutput::Skip => Ok(false),
        StreamOutput::Stop => Ok(true),
        StreamOutput::Error(detail) => {
            let mut usage = Usage::from(&state.usage());
            fill_missing_usage(&mut usage, info, state.response_text());
            warn!(
                event = "claude_stream_error",
                channel_id = info.channel_id,
                error_type = %detail.kind,
                message = %detail.message
            );
            Err(RelayError::mid_stream(detail.kind, detail.message, usage))
        }
    }
}

#[cfg(test)]
mod tests;
