use onerelay_protocol::claude::messages::{ClaudeUsage, ContentBlock, MessageResponse};
use onerelay_protocol::openai::chat::{
    ChatChoice, ChatCompletionResponse, ChatMessage, FunctionCall, MessageContent, ToolCall,
};
use onerelay_protocol::openai::{PromptTokensDetails, Usage};

pub fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

/// Prompt tokens include both cache segments so downstream pricing can split them back out.
pub fn usage_from_claude(usage: &ClaudeUsage) -> Usage {
    let prompt = usage.input_tokens
        + usage.cache_read_input_tokens
        + usage.cache_creation_input_tokens;
    let details = (usage.cache_read_input_tokens > 0 || usage.cache_creation_input_tokens > 0)
        .then(|| PromptTokensDetails {
            cached_tokens: usage.cache_read_input_tokens,
            cached_creation_tokens: usage.cache_creation_input_tokens,
        });
    Usage {
        prompt_tokens: prompt,
        completion_tokens: usage.output_tokens,
        total_tokens: prompt + usage.output_tokens,
        prompt_tokens_details: details,
        completion_tokens_details: None,
    }
}

pub fn transform_response(response: MessageResponse, created: i64) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text: part, .. } => text.push_str(&part),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    let message = ChatMessage {
        role: "assistant".to_string(),
        content: Some(MessageContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        ..Default::default()
    };

    ChatCompletionResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created,
        model: response.model,
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: response.stop_reason.as_deref().map(map_stop_reason),
        }],
        usage: Some(usage_from_claude(&response.usage)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn batch_response_keeps_text_thinking_and_tools() {
        let response: MessageResponse = serde_json::from_value(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "let me see", "signature": "sig"},
                {"type": "text", "text": "It is sunny."},
                {"type": "tool_use", "id": "toolu_1", "name": "weather", "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {
                "input_tokens": 100,
                "output_tokens": 30,
                "cache_read_input_tokens": 40,
                "cache_creation_input_tokens": 10
            }
        }))
        .unwrap();

        let out = transform_response(response, 1_700_000_000);
        let choice = &out.choices[0];
        assert_eq!(out.id, "msg_01");
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(choice.message.text_content(), "It is sunny.");
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("let me see"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"city":"Oslo"}"#);

        let usage = out.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 150);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 180);
        let details = usage.prompt_tokens_details.unwrap();
        assert_eq!(details.cached_tokens, 40);
        assert_eq!(details.cached_creation_tokens, 10);
    }

    #[test]
    fn stop_reasons_map_to_openai_names() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("stop_sequence"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("tool_use"), "tool_calls");
        assert_eq!(map_stop_reason("refusal"), "refusal");
    }
}
