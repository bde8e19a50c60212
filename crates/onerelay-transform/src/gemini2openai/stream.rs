use std::collections::BTreeMap;

use onerelay_protocol::gemini::generate_content::{
    Candidate, GeminiContent, GeminiPart, GenerateContentResponse,
};
use onerelay_protocol::openai::chat::{ChatCompletionChunk, FunctionCall, ToolCall};

use crate::gemini2openai::response::{function_call_part, map_finish_reason, usage_metadata};

/// Re-encodes OpenAI chat chunks as Gemini `streamGenerateContent` responses.
///
/// Tool call fragments are buffered until the choice finishes, since Gemini
/// emits each function call whole.
#[derive(Debug, Clone, Default)]
pub struct GeminiStreamState {
    model: String,
    tool_calls: BTreeMap<u32, ToolCall>,
}

impl GeminiStreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tool_calls: BTreeMap::new(),
        }
    }

    pub fn transform_chunk(
        &mut self,
        chunk: ChatCompletionChunk,
    ) -> Option<GenerateContentResponse> {
        let usage = chunk.usage.as_ref().map(usage_metadata);
        let mut candidates = Vec::new();

        for choice in chunk.choices {
            let mut parts = Vec::new();
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
                parts.push(GeminiPart {
                    text: Some(reasoning),
                    thought: Some(true),
                    ..Default::default()
                });
            }
            if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
                parts.push(GeminiPart::text(text));
            }
            for fragment in delta.tool_calls.into_iter().flatten() {
                let entry = self.tool_calls.entry(fragment.index).or_insert_with(|| ToolCall {
                    id: String::new(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: String::new(),
                        arguments: String::new(),
                    },
                });
                if let Some(id) = fragment.id {
                    entry.id = id;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        entry.function.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.function.arguments.push_str(&arguments);
                    }
                }
            }

            let finish_reason = choice.finish_reason.as_deref().map(map_finish_reason);
            if finish_reason.is_some() {
                for call in std::mem::take(&mut self.tool_calls).values() {
                    parts.push(function_call_part(call));
                }
            }
            if parts.is_empty() && finish_reason.is_none() {
                continue;
            }
            candidates.push(Candidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason,
                index: choice.index,
            });
        }

        if candidates.is_empty() && usage.is_none() {
            return None;
        }
        Some(GenerateContentResponse {
            candidates,
            usage_metadata: usage,
            model_version: Some(self.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn chunk(value: serde_json::Value) -> ChatCompletionChunk {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn tool_fragments_flush_on_finish() {
        let mut state = GeminiStreamState::new("gemini-2.0-flash");
        assert!(state
            .transform_chunk(chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]})))
            .is_none());

        let text = state
            .transform_chunk(chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "Hi"}}]})))
            .unwrap();
        assert_eq!(text.candidates[0].content.parts[0].text.as_deref(), Some("Hi"));

        assert!(state
            .transform_chunk(chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\""}}
            ]}}]})))
            .is_none());
        assert!(state
            .transform_chunk(chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":\"rust\"}"}}
            ]}}]})))
            .is_none());

        let done = state
            .transform_chunk(chunk(json!({"id": "c", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})))
            .unwrap();
        let candidate = &done.candidates[0];
        assert_eq!(candidate.finish_reason.as_deref(), Some("STOP"));
        let call = candidate.content.parts[0].function_call.as_ref().unwrap();
        assert_eq!(call.name, "lookup");
        assert_eq!(call.args, json!({"q": "rust"}));
    }

    #[test]
    fn usage_only_chunk_carries_metadata() {
        let mut state = GeminiStreamState::new("m");
        let out = state
            .transform_chunk(chunk(json!({"id": "c", "choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}})))
            .unwrap();
        assert!(out.candidates.is_empty());
        assert_eq!(out.usage_metadata.unwrap().candidates_token_count, 2);
    }
}
