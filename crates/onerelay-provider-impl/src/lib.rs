//! Built-in upstream adaptors.

pub mod claude;
pub mod image_loader;
pub mod openai_compat;
pub mod tokens;

use std::sync::Arc;

use time::OffsetDateTime;

use onerelay_provider_core::{AdaptorRegistry, ChannelType};
use onerelay_transform::ImageLoader;

pub use claude::ClaudeAdaptor;
pub use image_loader::HttpImageLoader;
pub use openai_compat::OpenAICompatAdaptor;

/// Channel types served by the OpenAI-compatible adaptor.
pub const OPENAI_COMPATIBLE_TYPES: &[ChannelType] = &[
    ChannelType::OpenAI,
    ChannelType::Azure,
    ChannelType::Ollama,
    ChannelType::Custom,
    ChannelType::Gemini,
    ChannelType::Cloudflare,
    ChannelType::DeepSeek,
    ChannelType::VolcEngine,
    ChannelType::BaiduV2,
    ChannelType::Xai,
];

pub fn register_builtin_adaptors(registry: &mut AdaptorRegistry, images: Arc<dyn ImageLoader>) {
    registry.register(&[ChannelType::Anthropic], Arc::new(ClaudeAdaptor::new(images)));
    registry.register(OPENAI_COMPATIBLE_TYPES, Arc::new(OpenAICompatAdaptor::new()));
}

pub fn builtin_registry(images: Arc<dyn ImageLoader>) -> AdaptorRegistry {
    let mut registry = AdaptorRegistry::new();
    register_builtin_adaptors(&mut registry, images);
    registry
}

pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
