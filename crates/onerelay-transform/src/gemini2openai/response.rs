use serde_json::Value;

use onerelay_protocol::gemini::generate_content::{
    Candidate, GeminiContent, GeminiFunctionCall, GeminiPart, GenerateContentResponse,
    UsageMetadata,
};
use onerelay_protocol::openai::Usage;
use onerelay_protocol::openai::chat::{ChatCompletionResponse, ToolCall};

pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        _ => "STOP",
    }
    .to_string()
}

pub fn usage_metadata(usage: &Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: usage.prompt_tokens,
        candidates_token_count: usage.completion_tokens,
        total_token_count: usage.total_tokens,
        thoughts_token_count: usage
            .completion_tokens_details
            .as_ref()
            .map(|details| details.reasoning_tokens)
            .filter(|tokens| *tokens > 0),
    }
}

pub(crate) fn function_call_part(call: &ToolCall) -> GeminiPart {
    let args = serde_json::from_str::<Value>(&call.function.arguments)
        .unwrap_or_else(|_| Value::Object(Default::default()));
    GeminiPart {
        function_call: Some(GeminiFunctionCall {
            name: call.function.name.clone(),
            args,
        }),
        ..Default::default()
    }
}

pub fn transform_response(response: ChatCompletionResponse) -> GenerateContentResponse {
    let candidates = response
        .choices
        .into_iter()
        .map(|choice| {
            let mut parts = Vec::new();
            if let Some(reasoning) = choice.message.reasoning_content.as_deref()
                && !reasoning.is_empty()
            {
                parts.push(GeminiPart {
                    text: Some(reasoning.to_string()),
                    thought: Some(true),
                    ..Default::default()
                });
            }
            let text = choice.message.text_content();
            if !text.is_empty() {
                parts.push(GeminiPart::text(text));
            }
            for call in choice.message.tool_calls.iter().flatten() {
                parts.push(function_call_part(call));
            }
            Candidate {
                content: GeminiContent {
                    role: Some("model".to_string()),
                    parts,
                },
                finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
                index: choice.index,
            }
        })
        .collect();

    GenerateContentResponse {
        candidates,
        usage_metadata: response.usage.as_ref().map(usage_metadata),
        model_version: Some(response.model),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn chat_completion_maps_to_candidates() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gemini-2.0-flash",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Calling the tool.",
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "lookup", "arguments": "{\"id\":7}"}}]
                },
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}
        }))
        .unwrap();

        let out = transform_response(response);
        let candidate = &out.candidates[0];
        assert_eq!(candidate.finish_reason.as_deref(), Some("MAX_TOKENS"));
        assert_eq!(candidate.content.parts[0].text.as_deref(), Some("Calling the tool."));
        let call = candidate.content.parts[1].function_call.as_ref().unwrap();
        assert_eq!(call.args, json!({"id": 7}));
        let usage = out.usage_metadata.unwrap();
        assert_eq!(usage.total_token_count, 13);
    }
}
