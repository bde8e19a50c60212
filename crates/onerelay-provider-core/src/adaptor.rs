use async_trait::async_trait;
use bytes::Bytes;

use onerelay_protocol::JsonObject;
use onerelay_protocol::claude::messages::CreateMessageRequest;
use onerelay_protocol::openai::audio::SpeechRequest;
use onerelay_protocol::openai::chat::ChatCompletionRequest;
use onerelay_protocol::openai::embeddings::EmbeddingRequest;
use onerelay_protocol::openai::images::ImageGenerationRequest;
use onerelay_protocol::openai::rerank::RerankRequest;

use crate::errors::{ProviderError, ProviderResult};
use crate::relay_error::RelayError;
use crate::relay_info::RelayInfo;
use crate::upstream::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, header_set,
};
use crate::usage::Usage;
use crate::writer::ResponseWriter;

/// A converted request body plus its media type.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody {
    pub content_type: String,
    pub bytes: Bytes,
}

impl RequestBody {
    pub fn json<T: serde::Serialize>(value: &T) -> ProviderResult<Self> {
        Ok(Self {
            content_type: "application/json".to_string(),
            bytes: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    /// Serializes `value` and lays the channel's parameter override over the top-level keys.
    pub fn json_with_override<T: serde::Serialize>(
        value: &T,
        param_override: &JsonObject,
    ) -> ProviderResult<Self> {
        if param_override.is_empty() {
            return Self::json(value);
        }
        let mut encoded = serde_json::to_value(value)?;
        let Some(object) = encoded.as_object_mut() else {
            return Err(ProviderError::Encode(
                "parameter override needs an object body".to_string(),
            ));
        };
        for (key, value) in param_override {
            object.insert(key.clone(), value.clone());
        }
        Self::json(&encoded)
    }

    pub fn raw(content_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Audio requests: speech is JSON, transcription/translation is a raw multipart upload.
#[derive(Debug, Clone)]
pub enum AudioRequest {
    Speech(SpeechRequest),
    Form { content_type: String, body: Bytes },
}

/// Image requests: generations are JSON, edits are forwarded as received.
#[derive(Debug, Clone)]
pub enum ImageRequest {
    Generation(ImageGenerationRequest),
    Edit { content_type: String, body: Bytes },
}

#[derive(Debug)]
pub enum AdaptorOutput {
    Batch {
        status: u16,
        content_type: String,
        body: Bytes,
        usage: Usage,
    },
    /// Frames were written to the [`ResponseWriter`].
    Stream {
        usage: Usage,
        /// Upstream closed without its terminal frame; usage is estimated.
        truncated: bool,
    },
}

impl AdaptorOutput {
    pub fn usage(&self) -> Usage {
        match self {
            AdaptorOutput::Batch { usage, .. } | AdaptorOutput::Stream { usage, .. } => *usage,
        }
    }
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self, _info: &mut RelayInfo) {}

    async fn convert_chat_request(
        &self,
        _info: &mut RelayInfo,
        _req: ChatCompletionRequest,
    ) -> ProviderResult<RequestBody> {
        Err(ProviderError::Unsupported("chat completions"))
    }

    async fn convert_claude_request(
        &self,
        _info: &mut RelayInfo,
        _req: CreateMessageRequest,
    ) -> ProviderResult<RequestBody> {
        Err(ProviderError::Unsupported("claude messages"))
    }

    async fn convert_embedding_request(
        &self,
        _info: &mut RelayInfo,
        _req: EmbeddingRequest,
    ) -> ProviderResult<RequestBody> {
        Err(ProviderError::Unsupported("embeddings"))
    }

    async fn convert_image_request(
        &self,
        _info: &mut RelayInfo,
        _req: ImageRequest,
    ) -> ProviderResult<RequestBody> {
        Err(ProviderError::Unsupported("images"))
    }

    async fn convert_audio_request(
        &self,
        _info: &mut RelayInfo,
        _req: AudioRequest,
    ) -> ProviderResult<RequestBody> {
        Err(ProviderError::Unsupported("audio"))
    }

    async fn convert_rerank_request(
        &self,
        _info: &mut RelayInfo,
        _req: RerankRequest,
    ) -> ProviderResult<RequestBody> {
        Err(ProviderError::Unsupported("rerank"))
    }

    fn build_request_url(&self, info: &RelayInfo) -> ProviderResult<String>;

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut Headers)
    -> ProviderResult<()>;

    /// Assembles the outbound request; channel header overrides win.
    fn build_request(
        &self,
        info: &RelayInfo,
        body: RequestBody,
    ) -> ProviderResult<UpstreamHttpRequest> {
        let url = self.build_request_url(info)?;
        let mut headers = Headers::new();
        header_set(&mut headers, "content-type", body.content_type);
        if info.is_stream {
            header_set(&mut headers, "accept", "text/event-stream");
        }
        self.setup_request_headers(info, &mut headers)?;
        for (name, value) in &info.header_override {
            header_set(&mut headers, name, value.clone());
        }
        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(body.bytes),
            is_stream: info.is_stream,
        })
    }

    async fn do_request(
        &self,
        client: &dyn UpstreamClient,
        req: UpstreamHttpRequest,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        client.send(req).await
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        resp: UpstreamHttpResponse,
        writer: &mut ResponseWriter,
    ) -> Result<AdaptorOutput, RelayError> {
        match resp.body {
            UpstreamBody::Bytes(body) => {
                let content_type = crate::upstream::header_get(&resp.headers, "content-type")
                    .unwrap_or("application/json")
                    .to_string();
                self.handle_batch(info, resp.status, content_type, body).await
            }
            UpstreamBody::Stream(rx) => self.handle_stream(info, rx, writer).await,
        }
    }

    async fn handle_batch(
        &self,
        info: &mut RelayInfo,
        status: u16,
        content_type: String,
        body: Bytes,
    ) -> Result<AdaptorOutput, RelayError>;

    async fn handle_stream(
        &self,
        info: &mut RelayInfo,
        rx: crate::upstream::ByteStream,
        writer: &mut ResponseWriter,
    ) -> Result<AdaptorOutput, RelayError>;
}
