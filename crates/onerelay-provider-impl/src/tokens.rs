//! Local token estimation for callers and upstreams that omit usage.

use std::sync::OnceLock;

use onerelay_protocol::openai::chat::{ChatCompletionRequest, ContentPart};
use onerelay_protocol::openai::embeddings::EmbeddingRequest;
use onerelay_provider_core::{RelayInfo, Usage};
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base, p50k_base, r50k_base};
use tracing::warn;

/// Per-message framing overhead used by OpenAI's own accounting.
const TOKENS_PER_MESSAGE: i64 = 3;
const TOKENS_PER_NAME: i64 = 1;
/// Flat charge for an attached image when the detail level is unknown.
const TOKENS_PER_IMAGE: i64 = 765;

static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static P50K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static R50K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn cached<E: std::fmt::Display>(
    cell: &'static OnceLock<Option<CoreBPE>>,
    name: &'static str,
    build: fn() -> Result<CoreBPE, E>,
) -> Option<&'static CoreBPE> {
    cell.get_or_init(|| match build() {
        Ok(bpe) => Some(bpe),
        Err(err) => {
            warn!(event = "tokenizer_unavailable", encoding = name, error = %err);
            None
        }
    })
    .as_ref()
}

/// The model's encoder, falling back to o200k. Each encoding is built once per process.
pub fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    let specific = match get_tokenizer(model) {
        Some(Tokenizer::Cl100kBase) => cached(&CL100K, "cl100k_base", cl100k_base),
        Some(Tokenizer::P50kBase) => cached(&P50K, "p50k_base", p50k_base),
        Some(Tokenizer::R50kBase) => cached(&R50K, "r50k_base", r50k_base),
        _ => None,
    };
    specific.or_else(|| cached(&O200K, "o200k_base", o200k_base))
}

fn count_with(bpe: Option<&CoreBPE>, text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    match bpe {
        Some(bpe) => bpe.encode_ordinary(text).len() as i64,
        // Roughly four characters per token for Latin text.
        None => (text.chars().count() as i64 + 3) / 4,
    }
}

/// Counts `text` with the model's encoder.
pub fn count_text_tokens(model: &str, text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    count_with(bpe_for_model(model), text)
}

/// Prompt estimate for a chat request, used for pre-consumption.
pub fn count_chat_prompt_tokens(request: &ChatCompletionRequest) -> i64 {
    let bpe = bpe_for_model(&request.model);
    let mut total = 3;
    for message in &request.messages {
        total += TOKENS_PER_MESSAGE;
        total += count_with(bpe, &message.role);
        if message.name.is_some() {
            total += TOKENS_PER_NAME;
        }
        for part in message.parts() {
            match part {
                ContentPart::Text { text } => total += count_with(bpe, &text),
                ContentPart::ImageUrl { .. } => total += TOKENS_PER_IMAGE,
                ContentPart::InputAudio { .. } | ContentPart::File { .. } => {}
            }
        }
        for call in message.tool_calls.iter().flatten() {
            total += count_with(bpe, &call.function.name);
            total += count_with(bpe, &call.function.arguments);
        }
    }
    for tool in request.tools.iter().flatten() {
        total += count_with(bpe, &tool.function.name);
        if let Some(description) = &tool.function.description {
            total += count_with(bpe, description);
        }
        if let Some(parameters) = &tool.function.parameters {
            total += count_with(bpe, &parameters.to_string());
        }
    }
    total
}

/// Falls back to the local prompt estimate and a tokenizer count of the reply.
pub fn fill_missing_usage(usage: &mut Usage, info: &RelayInfo, text: &str) {
    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = info.prompt_tokens;
    }
    if usage.completion_tokens == 0 {
        usage.completion_tokens = count_text_tokens(&info.upstream_model, text);
    }
    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
}

pub fn count_embedding_tokens(request: &EmbeddingRequest) -> i64 {
    let bpe = bpe_for_model(&request.model);
    request
        .input_texts()
        .iter()
        .map(|text| count_with(bpe, text))
        .sum()
}
