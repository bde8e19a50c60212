use serde::{Deserialize, Serialize};

use onerelay_protocol::openai;

/// Token counts for one relayed call.
///
/// `prompt_tokens` includes the cached and cache-creation segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    pub reasoning_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    pub fn to_openai(&self) -> openai::Usage {
        let details = (self.cached_tokens > 0 || self.cache_creation_tokens > 0).then(|| {
            openai::PromptTokensDetails {
                cached_tokens: clamp(self.cached_tokens),
                cached_creation_tokens: clamp(self.cache_creation_tokens),
            }
        });
        openai::Usage {
            prompt_tokens: clamp(self.prompt_tokens),
            completion_tokens: clamp(self.completion_tokens),
            total_tokens: clamp(self.total_tokens),
            prompt_tokens_details: details,
            completion_tokens_details: (self.reasoning_tokens > 0).then(|| {
                openai::CompletionTokensDetails {
                    reasoning_tokens: clamp(self.reasoning_tokens),
                }
            }),
        }
    }
}

fn clamp(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

impl From<&openai::Usage> for Usage {
    fn from(usage: &openai::Usage) -> Self {
        let details = usage.prompt_tokens_details.clone().unwrap_or_default();
        let prompt = usage.prompt_tokens as i64;
        let completion = usage.completion_tokens as i64;
        let total = match usage.total_tokens as i64 {
            0 => prompt + completion,
            total => total,
        };
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            cached_tokens: details.cached_tokens as i64,
            cache_creation_tokens: details.cached_creation_tokens as i64,
            reasoning_tokens: usage
                .completion_tokens_details
                .as_ref()
                .map(|d| d.reasoning_tokens as i64)
                .unwrap_or(0),
        }
    }
}
