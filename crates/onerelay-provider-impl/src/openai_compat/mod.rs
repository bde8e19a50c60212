//! Adaptor for every upstream that speaks the OpenAI wire format.

mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AUTHORIZATION;
use serde_json::Value;

use onerelay_protocol::openai;
use onerelay_protocol::openai::chat::{ChatCompletionRequest, ChatCompletionResponse, StreamOptions};
use onerelay_protocol::openai::embeddings::{EmbeddingRequest, EmbeddingResponseUsage};
use onerelay_protocol::openai::rerank::RerankRequest;
use onerelay_provider_core::{
    Adaptor, AdaptorOutput, AudioRequest, ByteStream, ChannelType, Headers, ImageRequest,
    ProviderError, ProviderResult, RelayError, RelayFormat, RelayInfo, RelayMode, RequestBody,
    ResponseWriter, Usage, encode_batch, header_set,
};

use crate::tokens::{count_text_tokens, fill_missing_usage};

pub const ADAPTOR_NAME: &str = "openai";
const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";
const XAI_REASONING_MODEL: &str = "grok-3-mini";
const REASONING_EFFORTS: [&str; 3] = ["high", "medium", "low"];

#[derive(Debug, Default)]
pub struct OpenAICompatAdaptor;

impl OpenAICompatAdaptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adaptor for OpenAICompatAdaptor {
    fn name(&self) -> &'static str {
        ADAPTOR_NAME
    }

    async fn convert_chat_request(
        &self,
        info: &mut RelayInfo,
        mut req: ChatCompletionRequest,
    ) -> ProviderResult<RequestBody> {
        req.model = info.upstream_model.clone();
        if info.is_stream {
            req.stream = Some(true);
            // Usage is needed for billing even when the caller did not ask for it.
            req.stream_options = info
                .supports_stream_options
                .then_some(StreamOptions { include_usage: true });
        } else {
            req.stream_options = None;
        }

        match info.channel_type {
            ChannelType::OpenAI | ChannelType::Azure if is_reasoning_model(&req.model) => {
                move_to_max_completion_tokens(&mut req);
                req.temperature = None;
            }
            ChannelType::Xai => apply_xai_reasoning(&mut req),
            _ => {}
        }
        RequestBody::json_with_override(&req, &info.param_override)
    }

    async fn convert_embedding_request(
        &self,
        info: &mut RelayInfo,
        mut req: EmbeddingRequest,
    ) -> ProviderResult<RequestBody> {
        req.model = info.upstream_model.clone();
        RequestBody::json_with_override(&req, &info.param_override)
    }

    async fn convert_image_request(
        &self,
        info: &mut RelayInfo,
        req: ImageRequest,
    ) -> ProviderResult<RequestBody> {
        match req {
            ImageRequest::Generation(mut req) => {
                req.model = info.upstream_model.clone();
                RequestBody::json_with_override(&req, &info.param_override)
            }
            ImageRequest::Edit { content_type, body } => Ok(RequestBody::raw(content_type, body)),
        }
    }

    async fn convert_audio_request(
        &self,
        info: &mut RelayInfo,
        req: AudioRequest,
    ) -> ProviderResult<RequestBody> {
        match req {
            AudioRequest::Speech(mut req) => {
                req.model = info.upstream_model.clone();
                RequestBody::json_with_override(&req, &info.param_override)
            }
            AudioRequest::Form { content_type, body } => Ok(RequestBody::raw(content_type, body)),
        }
    }

    async fn convert_rerank_request(
        &self,
        info: &mut RelayInfo,
        mut req: RerankRequest,
    ) -> ProviderResult<RequestBody> {
        req.model = info.upstream_model.clone();
        RequestBody::json_with_override(&req, &info.param_override)
    }

    fn build_request_url(&self, info: &RelayInfo) -> ProviderResult<String> {
        request_url(info)
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut Headers) -> ProviderResult<()> {
        if info.channel_type == ChannelType::Azure {
            header_set(headers, "api-key", info.api_key.clone());
        } else {
            header_set(
                headers,
                AUTHORIZATION.as_str(),
                format!("Bearer {}", info.api_key),
            );
        }
        if info.channel_type == ChannelType::OpenAI
            && let Some(organization) = info.organization.as_deref().filter(|org| !org.is_empty())
        {
            header_set(headers, "openai-organization", organization);
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
        let usage = match info.mode {
            RelayMode::Embeddings => embedding_usage(info, &body),
            RelayMode::ImagesGenerations | RelayMode::ImagesEdits | RelayMode::AudioSpeech => {
                Usage::new(info.prompt_tokens, 0)
            }
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => {
                transcription_usage(info, &content_type, &body)
            }
            RelayMode::Rerank => rerank_usage(info, &body),
            RelayMode::ChatCompletions
            | RelayMode::Completions
            | RelayMode::GeminiGenerate
            | RelayMode::ClaudeMessages => chat_usage(info, &body),
        };

        if info.format == RelayFormat::Gemini {
            let chat: ChatCompletionResponse = serde_json::from_slice(&body).map_err(|err| {
                RelayError::upstream(
                    500,
                    Some("bad_response_body".to_string()),
                    "upstream_error",
                    format!("unmarshal chat response failed: {err}"),
                )
            })?;
            let body = encode_batch(RelayFormat::Gemini, chat)?;
            return Ok(AdaptorOutput::Batch {
                status,
                content_type: "application/json".to_string(),
                body,
                usage,
            });
        }

        Ok(AdaptorOutput::Batch {
            status,
            content_type,
            body,
            usage,
        })
    }

    async fn handle_stream(
        &self,
        info: &mut RelayInfo,
        rx: ByteStream,
        writer: &mut ResponseWriter,
    ) -> Result<AdaptorOutput, RelayError> {
        stream::relay_stream(info, rx, writer).await
    }
}

/// Upstream URL for the request's mode, honoring per-type path layouts.
pub fn request_url(info: &RelayInfo) -> ProviderResult<String> {
    let base = info.base_url.as_str();
    let path = info.mode.path();
    let tail = path.strip_prefix("/v1").unwrap_or(path);

    let url = match info.channel_type {
        ChannelType::Azure => {
            let version = info
                .api_version
                .as_deref()
                .unwrap_or(DEFAULT_AZURE_API_VERSION);
            let deployment = info.upstream_model.replace('.', "");
            format!("{base}/openai/deployments/{deployment}{tail}?api-version={version}")
        }
        ChannelType::Gemini => format!("{base}/v1beta/openai{tail}"),
        ChannelType::Cloudflare => {
            let account = info.api_version.as_deref().ok_or_else(|| {
                ProviderError::InvalidConfig("cloudflare channel needs an account id".to_string())
            })?;
            format!("{base}/client/v4/accounts/{account}/ai/v1{tail}")
        }
        ChannelType::VolcEngine => format!("{base}/api/v3{tail}"),
        ChannelType::BaiduV2 => format!("{base}/v2{tail}"),
        _ => format!("{base}{path}"),
    };
    Ok(url)
}

/// `o1`, `o3-mini`, `o4-mini` and friends reject `max_tokens` and `temperature`.
fn is_reasoning_model(model: &str) -> bool {
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

fn move_to_max_completion_tokens(req: &mut ChatCompletionRequest) {
    if req.max_completion_tokens.is_none()
        && let Some(max_tokens) = req.max_tokens.take()
    {
        req.max_completion_tokens = Some(max_tokens);
    }
}

/// `grok-3-mini-high` style names select a reasoning effort on the base model.
fn apply_xai_reasoning(req: &mut ChatCompletionRequest) {
    if !req.model.starts_with(XAI_REASONING_MODEL) {
        return;
    }
    move_to_max_completion_tokens(req);
    for effort in REASONING_EFFORTS {
        if let Some(base) = req.model.strip_suffix(&format!("-{effort}")) {
            req.model = base.to_string();
            req.extra
                .insert("reasoning_effort".to_string(), Value::String(effort.to_string()));
            break;
        }
    }
}

fn chat_usage(info: &RelayInfo, body: &[u8]) -> Usage {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let mut usage = value
        .get("usage")
        .and_then(|usage| serde_json::from_value::<openai::Usage>(usage.clone()).ok())
        .map(|usage| Usage::from(&usage))
        .unwrap_or_default();
    if usage.completion_tokens == 0 {
        fill_missing_usage(&mut usage, info, &choice_text(&value));
    }
    usage
}

/// Text of every choice; legacy completions carry `text`, chat carries `message.content`.
fn choice_text(value: &Value) -> String {
    value
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|choice| {
                    choice
                        .pointer("/message/content")
                        .or_else(|| choice.get("text"))
                        .and_then(Value::as_str)
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn embedding_usage(info: &RelayInfo, body: &[u8]) -> Usage {
    let prompt = serde_json::from_slice::<EmbeddingResponseUsage>(body)
        .ok()
        .and_then(|parsed| parsed.usage)
        .map(|usage| usage.prompt_tokens as i64)
        .filter(|tokens| *tokens > 0)
        .unwrap_or(info.prompt_tokens);
    Usage::new(prompt, 0)
}

fn transcription_usage(info: &RelayInfo, content_type: &str, body: &[u8]) -> Usage {
    let text = if content_type.contains("json") {
        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|value| value.get("text").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default()
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    Usage::new(info.prompt_tokens, count_text_tokens(&info.upstream_model, &text))
}

fn rerank_usage(info: &RelayInfo, body: &[u8]) -> Usage {
    let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let tokens = value
        .pointer("/usage/total_tokens")
        .or_else(|| value.pointer("/usage/prompt_tokens"))
        .and_then(Value::as_i64)
        .filter(|tokens| *tokens > 0)
        .unwrap_or(info.prompt_tokens);
    Usage::new(tokens, 0)
}
