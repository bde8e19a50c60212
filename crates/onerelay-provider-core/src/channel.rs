use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use onerelay_protocol::JsonObject;

/// Upstream provider family of a channel, numbered as stored in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ChannelType {
    OpenAI,
    Azure,
    Ollama,
    Custom,
    Anthropic,
    Gemini,
    Aws,
    Cloudflare,
    DeepSeek,
    VolcEngine,
    BaiduV2,
    Xai,
    Other(i32),
}

impl ChannelType {
    pub const fn as_i32(self) -> i32 {
        match self {
            ChannelType::OpenAI => 1,
            ChannelType::Azure => 3,
            ChannelType::Ollama => 4,
            ChannelType::Custom => 8,
            ChannelType::Anthropic => 14,
            ChannelType::Gemini => 24,
            ChannelType::Aws => 33,
            ChannelType::Cloudflare => 39,
            ChannelType::DeepSeek => 43,
            ChannelType::VolcEngine => 45,
            ChannelType::BaiduV2 => 46,
            ChannelType::Xai => 48,
            ChannelType::Other(value) => value,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ChannelType::OpenAI => "https://api.openai.com",
            ChannelType::Ollama => "http://localhost:11434",
            ChannelType::Anthropic => "https://api.anthropic.com",
            ChannelType::Gemini => "https://generativelanguage.googleapis.com",
            ChannelType::Cloudflare => "https://api.cloudflare.com",
            ChannelType::DeepSeek => "https://api.deepseek.com",
            ChannelType::VolcEngine => "https://ark.cn-beijing.volces.com",
            ChannelType::BaiduV2 => "https://qianfan.baidubce.com",
            ChannelType::Xai => "https://api.x.ai",
            ChannelType::Azure | ChannelType::Custom | ChannelType::Aws | ChannelType::Other(_) => {
                ""
            }
        }
    }

    /// Whether the upstream honors `stream_options.include_usage`.
    pub fn supports_stream_options(self) -> bool {
        matches!(
            self,
            ChannelType::OpenAI
                | ChannelType::Anthropic
                | ChannelType::Aws
                | ChannelType::Gemini
                | ChannelType::Cloudflare
                | ChannelType::Azure
                | ChannelType::VolcEngine
                | ChannelType::Ollama
                | ChannelType::Xai
                | ChannelType::DeepSeek
                | ChannelType::BaiduV2
        )
    }
}

impl From<i32> for ChannelType {
    fn from(value: i32) -> Self {
        match value {
            1 => ChannelType::OpenAI,
            3 => ChannelType::Azure,
            4 => ChannelType::Ollama,
            8 => ChannelType::Custom,
            14 => ChannelType::Anthropic,
            24 => ChannelType::Gemini,
            33 => ChannelType::Aws,
            39 => ChannelType::Cloudflare,
            43 => ChannelType::DeepSeek,
            45 => ChannelType::VolcEngine,
            46 => ChannelType::BaiduV2,
            48 => ChannelType::Xai,
            other => ChannelType::Other(other),
        }
    }
}

impl From<ChannelType> for i32 {
    fn from(value: ChannelType) -> Self {
        value.as_i32()
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::Other(value) => write!(f, "other({value})"),
            known => write!(f, "{known:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub const fn as_i32(self) -> i32 {
        match self {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }
}

impl TryFrom<i32> for ChannelStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChannelStatus::Enabled),
            2 => Ok(ChannelStatus::ManuallyDisabled),
            3 => Ok(ChannelStatus::AutoDisabled),
            other => Err(format!("unknown channel status {other}")),
        }
    }
}

impl From<ChannelStatus> for i32 {
    fn from(value: ChannelStatus) -> Self {
        value.as_i32()
    }
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Enabled
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_true() -> bool {
    true
}

/// A configured upstream endpoint plus the credentials used to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// One or more secrets, newline separated.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_true")]
    pub auto_ban: bool,
    #[serde(default)]
    pub test_model: Option<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Type specific: API version for Azure, region for regional providers.
    #[serde(default)]
    pub other: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub settings: JsonObject,
    #[serde(default)]
    pub param_override: JsonObject,
    #[serde(default)]
    pub header_override: HashMap<String, String>,
    #[serde(default)]
    pub response_time_ms: i64,
    #[serde(default)]
    pub test_time: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub created_at: i64,
}

impl Channel {
    pub fn new(id: i64, name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            id,
            name: name.into(),
            channel_type,
            key: String::new(),
            base_url: None,
            models: Vec::new(),
            groups: default_groups(),
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 0,
            tag: None,
            auto_ban: true,
            test_model: None,
            model_mapping: HashMap::new(),
            other: None,
            organization: None,
            settings: JsonObject::new(),
            param_override: JsonObject::new(),
            header_override: HashMap::new(),
            response_time_ms: 0,
            test_time: 0,
            used_quota: 0,
            created_at: 0,
        }
    }

    /// Trimmed, de-duplicated model names in their configured order.
    pub fn model_list(&self) -> Vec<String> {
        clean_list(&self.models)
    }

    pub fn group_list(&self) -> Vec<String> {
        clean_list(&self.groups)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.key
            .lines()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .collect()
    }

    pub fn base_url(&self) -> String {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => self.channel_type.default_base_url().to_string(),
        }
    }

    pub fn map_model(&self, origin: &str) -> Option<&str> {
        self.model_mapping
            .get(origin)
            .map(String::as_str)
            .filter(|mapped| !mapped.is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}

/// One derived (group, model, channel) eligibility entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u32,
    pub tag: Option<String>,
}

impl Channel {
    /// The models × groups product this channel serves.
    pub fn abilities(&self) -> Vec<Ability> {
        let models = self.model_list();
        let groups = self.group_list();
        let mut out = Vec::with_capacity(models.len() * groups.len());
        for model in &models {
            for group in &groups {
                out.push(Ability {
                    group: group.clone(),
                    model: model.clone(),
                    channel_id: self.id,
                    enabled: self.is_enabled(),
                    priority: self.priority,
                    weight: self.weight,
                    tag: self.tag.clone(),
                });
            }
        }
        out
    }
}

fn clean_list(items: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .iter()
        .flat_map(|item| item.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter(|item| seen.insert(item.to_string()))
        .map(str::to_string)
        .collect()
}
