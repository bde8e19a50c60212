use onerelay_protocol::claude::messages::{
    ClaudeContent, ContentBlock, CreateMessageRequest, SystemPrompt,
};
use onerelay_protocol::openai::audio::multipart_field;
use onerelay_protocol::openai::chat::{ChatCompletionRequest, ContentPart, MessageContent};
use onerelay_protocol::openai::embeddings::EmbeddingRequest;
use onerelay_protocol::openai::rerank::RerankRequest;
use onerelay_provider_core::{
    Adaptor, AudioRequest, ImageRequest, ProviderResult, RelayError, RelayFormat, RelayInfo,
    RelayMode, RequestBody, RequestMeta,
};
use onerelay_provider_impl::tokens::{
    count_chat_prompt_tokens, count_embedding_tokens, count_text_tokens,
};

use crate::filter::SensitiveFilter;

/// An inbound call in canonical or pass-through form.
///
/// Cloned once per attempt, since conversion consumes it.
#[derive(Debug, Clone)]
pub enum RelayRequest {
    Chat(ChatCompletionRequest),
    Claude(CreateMessageRequest),
    Embedding(EmbeddingRequest),
    Image(ImageRequest),
    Audio(AudioRequest),
    Rerank(RerankRequest),
}

impl RelayRequest {
    /// Model named by the caller; multipart uploads carry it as a form field.
    pub fn model(&self) -> Option<String> {
        let model = match self {
            RelayRequest::Chat(req) => req.model.clone(),
            RelayRequest::Claude(req) => req.model.clone(),
            RelayRequest::Embedding(req) => req.model.clone(),
            RelayRequest::Image(ImageRequest::Generation(req)) => req.model.clone(),
            RelayRequest::Image(ImageRequest::Edit { content_type, body })
            | RelayRequest::Audio(AudioRequest::Form { content_type, body }) => {
                multipart_field(content_type, body, "model")?
            }
            RelayRequest::Audio(AudioRequest::Speech(req)) => req.model.clone(),
            RelayRequest::Rerank(req) => req.model.clone(),
        };
        let model = model.trim().to_string();
        (!model.is_empty()).then_some(model)
    }

    /// Request metadata with a local prompt estimate for pre-consumption.
    pub fn meta(&self, mode: RelayMode, format: RelayFormat) -> Result<RequestMeta, RelayError> {
        let origin_model = self
            .model()
            .ok_or_else(|| RelayError::local(400, "invalid_request", "model is required"))?;

        let (prompt_tokens, max_tokens, is_stream, include_usage) = match self {
            RelayRequest::Chat(req) => (
                count_chat_prompt_tokens(req),
                req.requested_max_tokens() as i64,
                req.is_stream(),
                req.include_usage(),
            ),
            RelayRequest::Claude(req) => {
                let mut text = req.system.as_ref().map(SystemPrompt::text).unwrap_or_default();
                for message in &req.messages {
                    match &message.content {
                        ClaudeContent::Text(content) => text.push_str(content),
                        ClaudeContent::Blocks(blocks) => {
                            blocks
                                .iter()
                                .filter_map(ContentBlock::as_text)
                                .for_each(|part| text.push_str(part));
                        }
                    }
                }
                (
                    count_text_tokens(&origin_model, &text),
                    req.max_tokens as i64,
                    req.is_stream(),
                    false,
                )
            }
            RelayRequest::Embedding(req) => (count_embedding_tokens(req), 0, false, false),
            RelayRequest::Image(ImageRequest::Generation(req)) => {
                (count_text_tokens(&origin_model, &req.prompt), 0, false, false)
            }
            RelayRequest::Audio(AudioRequest::Speech(req)) => {
                (count_text_tokens(&origin_model, &req.input), 0, false, false)
            }
            RelayRequest::Image(ImageRequest::Edit { .. })
            | RelayRequest::Audio(AudioRequest::Form { .. }) => (0, 0, false, false),
            RelayRequest::Rerank(req) => {
                let mut tokens = count_text_tokens(&origin_model, &req.query);
                for document in &req.documents {
                    tokens += match document.as_str() {
                        Some(text) => count_text_tokens(&origin_model, text),
                        None => count_text_tokens(&origin_model, &document.to_string()),
                    };
                }
                (tokens, 0, false, false)
            }
        };

        Ok(RequestMeta {
            mode,
            format,
            origin_model,
            is_stream,
            include_usage,
            prompt_tokens,
            max_tokens,
        })
    }

    pub async fn convert(
        self,
        adaptor: &dyn Adaptor,
        info: &mut RelayInfo,
    ) -> ProviderResult<RequestBody> {
        match self {
            RelayRequest::Chat(req) => adaptor.convert_chat_request(info, req).await,
            RelayRequest::Claude(req) => adaptor.convert_claude_request(info, req).await,
            RelayRequest::Embedding(req) => adaptor.convert_embedding_request(info, req).await,
            RelayRequest::Image(req) => adaptor.convert_image_request(info, req).await,
            RelayRequest::Audio(req) => adaptor.convert_audio_request(info, req).await,
            RelayRequest::Rerank(req) => adaptor.convert_rerank_request(info, req).await,
        }
    }

    /// Runs every caller-written text through the filter.
    ///
    /// Raw uploads (image edits, transcriptions) are not inspected.
    pub fn apply_filter(&mut self, filter: &SensitiveFilter) -> Result<(), RelayError> {
        match self {
            RelayRequest::Chat(req) => {
                for message in &mut req.messages {
                    match &mut message.content {
                        Some(MessageContent::Text(text)) => {
                            filter.apply(text)?;
                        }
                        Some(MessageContent::Parts(parts)) => {
                            for part in parts {
                                if let ContentPart::Text { text } = part {
                                    filter.apply(text)?;
                                }
                            }
                        }
                        None => {}
                    }
                }
            }
            RelayRequest::Claude(req) => {
                if let Some(SystemPrompt::Text(text)) = &mut req.system {
                    filter.apply(text)?;
                }
                for message in &mut req.messages {
                    match &mut message.content {
                        ClaudeContent::Text(text) => {
                            filter.apply(text)?;
                        }
                        ClaudeContent::Blocks(blocks) => {
                            for block in blocks {
                                if let ContentBlock::Text { text, .. } = block {
                                    filter.apply(text)?;
                                }
                            }
                        }
                    }
                }
            }
            RelayRequest::Image(ImageRequest::Generation(req)) => {
                filter.apply(&mut req.prompt)?;
            }
            RelayRequest::Audio(AudioRequest::Speech(req)) => {
                filter.apply(&mut req.input)?;
            }
            RelayRequest::Rerank(req) => {
                filter.apply(&mut req.query)?;
            }
            RelayRequest::Embedding(_)
            | RelayRequest::Image(ImageRequest::Edit { .. })
            | RelayRequest::Audio(AudioRequest::Form { .. }) => {}
        }
        Ok(())
    }
}
