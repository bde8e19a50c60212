use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use onerelay_protocol::openai::chat::{ChatCompletionChunk, ChatCompletionResponse};
use onerelay_protocol::sse;
use onerelay_transform::gemini2openai::response::transform_response as chat_to_gemini;
use onerelay_transform::gemini2openai::stream::GeminiStreamState;

use crate::errors::{ProviderError, ProviderResult};
use crate::relay_info::{RelayFormat, RelayInfo};

pub const STREAM_BUFFER: usize = 16;

/// Downstream half of a streamed relay.
///
/// Canonical chunks are re-encoded into the caller's wire family. Once the
/// caller goes away further writes are dropped so the adaptor can keep
/// draining upstream for usage.
pub struct ResponseWriter {
    tx: mpsc::Sender<Bytes>,
    format: RelayFormat,
    gemini: GeminiStreamState,
    closed: bool,
}

impl ResponseWriter {
    pub fn new(tx: mpsc::Sender<Bytes>, format: RelayFormat, model: &str) -> Self {
        Self {
            tx,
            format,
            gemini: GeminiStreamState::new(model),
            closed: false,
        }
    }

    pub fn channel(format: RelayFormat, model: &str) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (Self::new(tx, format, model), rx)
    }

    pub fn format(&self) -> RelayFormat {
        self.format
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn write_raw(&mut self, info: &mut RelayInfo, bytes: Bytes) {
        if self.closed || bytes.is_empty() {
            return;
        }
        info.set_first_response_time();
        if self.tx.send(bytes).await.is_err() {
            debug!(event = "downstream_closed", channel_id = info.channel_id);
            self.closed = true;
        }
    }

    /// Writes one canonical chunk; `raw` is the upstream `data:` payload, forwarded
    /// verbatim to OpenAI-shaped callers so unknown fields survive.
    pub async fn write_chunk(
        &mut self,
        info: &mut RelayInfo,
        chunk: ChatCompletionChunk,
        raw: Option<&str>,
    ) -> ProviderResult<()> {
        let frame = match self.format {
            RelayFormat::OpenAI => match raw {
                Some(raw) => sse::encode_frame(None, raw),
                None => sse::encode_json(&chunk)?,
            },
            RelayFormat::Gemini => match self.gemini.transform_chunk(chunk) {
                Some(response) => sse::encode_json(&response)?,
                None => return Ok(()),
            },
            RelayFormat::Claude => return Err(ProviderError::Unsupported("claude stream encoding")),
        };
        self.write_raw(info, frame).await;
        Ok(())
    }

    pub async fn write_done(&mut self, info: &mut RelayInfo) {
        if self.format == RelayFormat::OpenAI {
            self.write_raw(info, sse::done_frame()).await;
        }
    }
}

/// Encodes a canonical batch response in the caller's wire family.
pub fn encode_batch(
    format: RelayFormat,
    response: ChatCompletionResponse,
) -> ProviderResult<Bytes> {
    let body = match format {
        RelayFormat::OpenAI => serde_json::to_vec(&response)?,
        RelayFormat::Gemini => serde_json::to_vec(&chat_to_gemini(response))?,
        RelayFormat::Claude => return Err(ProviderError::Unsupported("claude batch encoding")),
    };
    Ok(Bytes::from(body))
}
