use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use onerelay_protocol::JsonObject;
use onerelay_transform::claude2openai::stream::LastMessageType;
use onerelay_transform::openai2claude::request::ClaudeConvertOptions;

use crate::channel::{Channel, ChannelType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    ClaudeMessages,
    GeminiGenerate,
}

impl RelayMode {
    /// OpenAI-style request path for this mode.
    pub fn path(self) -> &'static str {
        match self {
            RelayMode::ChatCompletions | RelayMode::GeminiGenerate => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::ImagesEdits => "/v1/images/edits",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::Rerank => "/v1/rerank",
            RelayMode::ClaudeMessages => "/v1/messages",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        Some(match path {
            "/v1/chat/completions" => RelayMode::ChatCompletions,
            "/v1/completions" => RelayMode::Completions,
            "/v1/embeddings" => RelayMode::Embeddings,
            "/v1/images/generations" => RelayMode::ImagesGenerations,
            "/v1/images/edits" => RelayMode::ImagesEdits,
            "/v1/audio/speech" => RelayMode::AudioSpeech,
            "/v1/audio/transcriptions" => RelayMode::AudioTranscription,
            "/v1/audio/translations" => RelayMode::AudioTranslation,
            "/v1/rerank" => RelayMode::Rerank,
            "/v1/messages" => RelayMode::ClaudeMessages,
            _ if path.starts_with("/v1beta/models/") => RelayMode::GeminiGenerate,
            _ => return None,
        })
    }
}

/// Wire family the caller speaks; responses are encoded back into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayFormat {
    OpenAI,
    Claude,
    Gemini,
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    pub is_root: bool,
    pub token_unlimited: bool,
    pub accept_unset_ratio_model: bool,
}

/// What the inbound request asked for, before a channel is chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    pub mode: RelayMode,
    pub format: RelayFormat,
    pub origin_model: String,
    pub is_stream: bool,
    pub include_usage: bool,
    pub prompt_tokens: i64,
    pub max_tokens: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub model_price: f64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub cache_creation_ratio: f64,
    pub group_ratio: f64,
    pub use_price: bool,
    pub pre_consumed_quota: i64,
}

/// Per-request relay context.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub base_url: String,
    pub api_key: String,
    /// Azure API version or provider region, from the channel's `other` value.
    pub api_version: Option<String>,
    pub organization: Option<String>,
    pub channel_settings: JsonObject,
    pub param_override: JsonObject,
    pub header_override: HashMap<String, String>,

    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub group: String,
    pub token_unlimited: bool,

    pub origin_model: String,
    pub upstream_model: String,
    pub is_model_mapped: bool,

    pub mode: RelayMode,
    pub format: RelayFormat,
    pub is_stream: bool,
    pub supports_stream_options: bool,
    pub should_include_usage: bool,
    pub prompt_tokens: i64,

    pub start_time: Instant,
    first_response_time: Option<Instant>,

    pub claude_options: ClaudeConvertOptions,
    pub last_message_type: LastMessageType,
    pub price: PriceData,
    pub retry_index: u32,
}

impl RelayInfo {
    pub fn new(caller: &CallerInfo, channel: &Channel, api_key: &str, meta: &RequestMeta) -> Self {
        let (upstream_model, is_model_mapped) = match channel.map_model(&meta.origin_model) {
            Some(mapped) => (mapped.to_string(), true),
            None => (meta.origin_model.clone(), false),
        };

        Self {
            channel_id: channel.id,
            channel_type: channel.channel_type,
            channel_name: channel.name.clone(),
            base_url: channel.base_url(),
            api_key: api_key.to_string(),
            api_version: channel.other.clone().filter(|value| !value.trim().is_empty()),
            organization: channel.organization.clone(),
            channel_settings: channel.settings.clone(),
            param_override: channel.param_override.clone(),
            header_override: channel.header_override.clone(),
            user_id: caller.user_id,
            token_id: caller.token_id,
            token_name: caller.token_name.clone(),
            group: caller.group.clone(),
            token_unlimited: caller.token_unlimited,
            origin_model: meta.origin_model.clone(),
            upstream_model,
            is_model_mapped,
            mode: meta.mode,
            format: meta.format,
            is_stream: meta.is_stream,
            supports_stream_options: channel.channel_type.supports_stream_options(),
            // Claude-shaped callers get native frames with usage already inside.
            should_include_usage: meta.include_usage && meta.format != RelayFormat::Claude,
            prompt_tokens: meta.prompt_tokens,
            start_time: Instant::now(),
            first_response_time: None,
            claude_options: ClaudeConvertOptions::default(),
            last_message_type: LastMessageType::None,
            price: PriceData::default(),
            retry_index: 0,
        }
    }

    /// Records the first byte sent to the caller; later calls are no-ops.
    pub fn set_first_response_time(&mut self) {
        if self.first_response_time.is_none() {
            self.first_response_time = Some(Instant::now());
        }
    }

    pub fn has_send_response(&self) -> bool {
        self.first_response_time.is_some()
    }

    pub fn first_response_latency(&self) -> Option<Duration> {
        self.first_response_time
            .map(|at| at.saturating_duration_since(self.start_time))
    }

    pub fn channel_setting_str(&self, key: &str) -> Option<&str> {
        self.channel_settings
            .get(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> CallerInfo {
        CallerInfo {
            user_id: 7,
            token_id: 3,
            token_name: "ci".to_string(),
            group: "default".to_string(),
            is_root: false,
            token_unlimited: false,
            accept_unset_ratio_model: false,
        }
    }

    fn meta(format: RelayFormat) -> RequestMeta {
        RequestMeta {
            mode: RelayMode::ChatCompletions,
            format,
            origin_model: "gpt-4o".to_string(),
            is_stream: true,
            include_usage: true,
            prompt_tokens: 12,
            max_tokens: 0,
        }
    }

    #[test]
    fn context_copies_channel_and_maps_model() {
        let mut channel = Channel::new(9, "azure-east", ChannelType::Azure);
        channel.base_url = Some("https://east.openai.azure.com".to_string());
        channel.other = Some("2024-10-21".to_string());
        channel
            .model_mapping
            .insert("gpt-4o".to_string(), "gpt-4o-deploy".to_string());

        let info = RelayInfo::new(&caller(), &channel, "sk-az", &meta(RelayFormat::OpenAI));
        assert_eq!(info.upstream_model, "gpt-4o-deploy");
        assert!(info.is_model_mapped);
        assert_eq!(info.origin_model, "gpt-4o");
        assert_eq!(info.api_version.as_deref(), Some("2024-10-21"));
        assert!(info.supports_stream_options);
        assert!(info.should_include_usage);

        let claude = RelayInfo::new(&caller(), &channel, "sk-az", &meta(RelayFormat::Claude));
        assert!(!claude.should_include_usage);
    }

    #[test]
    fn first_response_time_is_set_once() {
        let channel = Channel::new(1, "c", ChannelType::Custom);
        let mut info = RelayInfo::new(&caller(), &channel, "k", &meta(RelayFormat::OpenAI));
        assert!(!info.has_send_response());
        info.set_first_response_time();
        let first = info.first_response_latency();
        std::thread::sleep(Duration::from_millis(5));
        info.set_first_response_time();
        assert!(info.has_send_response());
        assert_eq!(info.first_response_latency(), first);
        assert!(!info.supports_stream_options);
    }

    #[test]
    fn modes_round_trip_through_paths() {
        assert_eq!(
            RelayMode::from_path("/v1/audio/transcriptions"),
            Some(RelayMode::AudioTranscription)
        );
        assert_eq!(
            RelayMode::from_path("/v1beta/models/gemini-2.0-flash:generateContent"),
            Some(RelayMode::GeminiGenerate)
        );
        assert_eq!(RelayMode::from_path("/v1/unknown"), None);
    }
}
