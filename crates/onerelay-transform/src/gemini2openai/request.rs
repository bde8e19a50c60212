use std::collections::HashMap;

use onerelay_protocol::gemini::generate_content::{
    GeminiContent, GeminiPart, GenerateContentRequest,
};
use onerelay_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, ContentPart, FunctionCall, FunctionDefinition, ImageUrl,
    MessageContent, StopSequences, StreamOptions, Tool, ToolCall,
};

use crate::TransformError;

/// Builds the canonical chat request for a Gemini `generateContent` call.
///
/// Function calls get synthetic ids (`call_{n}`); a later `functionResponse`
/// is linked back to the most recent call with the same function name.
pub fn transform_request(
    model: &str,
    request: GenerateContentRequest,
    stream: bool,
) -> Result<ChatCompletionRequest, TransformError> {
    if request.contents.is_empty() {
        return Err(TransformError::InvalidRequest(
            "contents must not be empty".to_string(),
        ));
    }

    let mut messages = Vec::new();
    if let Some(system) = request.system_instruction {
        let text = join_text(&system);
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }

    let mut call_ids: HashMap<String, String> = HashMap::new();
    let mut next_call = 0usize;
    for content in request.contents {
        let role = match content.role.as_deref() {
            Some("model") => "assistant",
            _ => "user",
        };

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        for part in content.parts {
            if let Some(call) = part.function_call {
                let id = format!("call_{next_call}");
                next_call += 1;
                call_ids.insert(call.name.clone(), id.clone());
                tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: call.name,
                        arguments: call.args.to_string(),
                    },
                });
            } else if let Some(result) = part.function_response {
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(MessageContent::Text(result.response.to_string())),
                    tool_call_id: Some(call_ids.get(&result.name).cloned().unwrap_or_default()),
                    ..Default::default()
                });
            } else if let Some(data) = part.inline_data {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", data.mime_type, data.data),
                        detail: None,
                    },
                });
            } else if let Some(text) = part.text {
                parts.push(ContentPart::Text { text });
            }
        }

        if parts.is_empty() && tool_calls.is_empty() {
            continue;
        }
        let content = match parts.as_slice() {
            [] => None,
            [ContentPart::Text { text }] => Some(MessageContent::Text(text.clone())),
            _ => Some(MessageContent::Parts(parts)),
        };
        messages.push(ChatMessage {
            role: role.to_string(),
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..Default::default()
        });
    }

    let config = request.generation_config.unwrap_or_default();
    let tools: Vec<Tool> = request
        .tools
        .into_iter()
        .flatten()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|declaration| Tool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: declaration.name,
                description: declaration.description,
                parameters: declaration.parameters,
            },
        })
        .collect();

    Ok(ChatCompletionRequest {
        model: model.to_string(),
        messages,
        max_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        stop: config.stop_sequences.map(StopSequences::Many),
        stream: stream.then_some(true),
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools: (!tools.is_empty()).then_some(tools),
        ..Default::default()
    })
}

fn join_text(content: &GeminiContent) -> String {
    content
        .parts
        .iter()
        .filter_map(|part: &GeminiPart| part.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}
