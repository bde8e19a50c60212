use serde_json::Value;
use tracing::warn;

use onerelay_protocol::claude::messages::{
    ClaudeContent, ClaudeMessage, ClaudeTool, ClaudeToolChoice, ContentBlock, CreateMessageRequest,
    ImageSource, InputSchema, SystemPrompt, ThinkingConfig, ToolResultContent,
};
use onerelay_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, Tool, ToolCall, ToolChoice,
};

use crate::TransformError;
use crate::image::{ImageLoader, resolve_image};

pub const THINKING_SUFFIX: &str = "-thinking";
const THINKING_MIN_MAX_TOKENS: u32 = 1280;
const PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, Copy)]
pub struct ClaudeConvertOptions {
    pub default_max_tokens: u32,
    pub thinking_budget_percentage: f64,
}

impl Default for ClaudeConvertOptions {
    fn default() -> Self {
        Self {
            default_max_tokens: 8192,
            thinking_budget_percentage: 0.8,
        }
    }
}

pub async fn transform_request(
    request: &ChatCompletionRequest,
    options: &ClaudeConvertOptions,
    images: &dyn ImageLoader,
) -> Result<CreateMessageRequest, TransformError> {
    let max_tokens = match request.requested_max_tokens() {
        0 => options.default_max_tokens,
        n => n,
    };

    let mut out = CreateMessageRequest {
        model: request.model.clone(),
        messages: Vec::new(),
        system: None,
        max_tokens,
        stop_sequences: request.stop.clone().map(|stop| stop.into_vec()),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        tools: request.tools.as_ref().map(|tools| map_tools(tools)),
        tool_choice: request.tool_choice.as_ref().and_then(map_tool_choice),
        thinking: None,
        metadata: None,
    };

    if let Some(model) = request.model.strip_suffix(THINKING_SUFFIX) {
        out.max_tokens = out.max_tokens.max(THINKING_MIN_MAX_TOKENS);
        let budget = (out.max_tokens as f64 * options.thinking_budget_percentage) as u32;
        out.thinking = Some(ThinkingConfig::enabled(budget));
        out.temperature = Some(1.0);
        // A zero top_p is omitted on the wire.
        out.top_p = None;
        out.model = model.to_string();
    }

    let formatted = merge_consecutive(&request.messages);

    let mut system = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();
    let mut first = true;
    for message in formatted {
        if is_system_role(&message.role) {
            system.push(message.text_content());
            continue;
        }

        if first {
            first = false;
            if message.role != "user" {
                messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: ClaudeContent::Blocks(vec![ContentBlock::text(PLACEHOLDER)]),
                });
            }
        }

        if message.role == "tool" {
            let block = ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.as_ref().map(tool_result_content),
                is_error: None,
            };
            match messages.last_mut() {
                Some(last) if last.role == "user" => {
                    let content =
                        std::mem::replace(&mut last.content, ClaudeContent::Blocks(Vec::new()));
                    let mut blocks = content.into_blocks();
                    blocks.push(block);
                    last.content = ClaudeContent::Blocks(blocks);
                }
                _ => messages.push(ClaudeMessage {
                    role: "user".to_string(),
                    content: ClaudeContent::Blocks(vec![block]),
                }),
            }
            continue;
        }

        let content = match (&message.content, &message.tool_calls) {
            (Some(MessageContent::Text(text)), None) => ClaudeContent::Text(text.clone()),
            _ => ClaudeContent::Blocks(build_blocks(&message, images).await?),
        };
        messages.push(ClaudeMessage {
            role: message.role,
            content,
        });
    }

    if !system.is_empty() {
        out.system = Some(SystemPrompt::Text(system.join("\n")));
    }
    out.messages = messages;
    Ok(out)
}

fn is_system_role(role: &str) -> bool {
    role == "system" || role == "developer"
}

/// Normalizes roles and collapses back-to-back same-role string turns.
fn merge_consecutive(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        let mut current = ChatMessage {
            role: if message.role.is_empty() {
                "user".to_string()
            } else {
                message.role.clone()
            },
            content: message.content.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls: message
                .tool_calls
                .clone()
                .filter(|calls| !calls.is_empty()),
            ..Default::default()
        };

        if let Some(last) = out.last()
            && last.role == current.role
            && current.role != "tool"
            && last.tool_calls.is_none()
            && current.tool_calls.is_none()
            && last.is_string_content()
            && current.is_string_content()
        {
            let merged = format!("{} {}", last.text_content(), current.text_content());
            current.content = Some(MessageContent::Text(merged));
            out.pop();
        }

        if current.content.is_none() && current.tool_calls.is_none() {
            current.content = Some(MessageContent::Text(PLACEHOLDER.to_string()));
        }
        out.push(current);
    }
    out
}

async fn build_blocks(
    message: &ChatMessage,
    images: &dyn ImageLoader,
) -> Result<Vec<ContentBlock>, TransformError> {
    let mut blocks = Vec::new();
    for part in message.parts() {
        match part {
            ContentPart::Text { text } => blocks.push(ContentBlock::text(text)),
            ContentPart::ImageUrl { image_url } => {
                let image = resolve_image(&image_url.url, images).await?;
                blocks.push(ContentBlock::Image {
                    source: ImageSource {
                        kind: "base64".to_string(),
                        media_type: image.media_type,
                        data: image.data,
                    },
                });
            }
            ContentPart::InputAudio { .. } | ContentPart::File { .. } => {
                warn!(event = "claude_convert_skip_part", role = %message.role);
            }
        }
    }

    for call in message.tool_calls.iter().flatten() {
        if let Some(block) = tool_use_block(call) {
            blocks.push(block);
        }
    }
    Ok(blocks)
}

fn tool_use_block(call: &ToolCall) -> Option<ContentBlock> {
    let arguments = call.function.arguments.trim();
    let input = if arguments.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str::<Value>(arguments) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                warn!(
                    event = "claude_convert_bad_tool_arguments",
                    tool_call_id = %call.id,
                    arguments = %call.function.arguments
                );
                return None;
            }
        }
    };
    Some(ContentBlock::ToolUse {
        id: call.id.clone(),
        name: call.function.name.clone(),
        input,
    })
}

fn tool_result_content(content: &MessageContent) -> ToolResultContent {
    match content {
        MessageContent::Text(text) => ToolResultContent::Text(text.clone()),
        MessageContent::Parts(parts) => ToolResultContent::Blocks(
            parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(ContentBlock::text(text.clone())),
                    _ => None,
                })
                .collect(),
        ),
    }
}

fn map_tools(tools: &[Tool]) -> Vec<ClaudeTool> {
    tools
        .iter()
        .map(|tool| {
            let mut schema = InputSchema {
                kind: "object".to_string(),
                ..Default::default()
            };
            if let Some(Value::Object(params)) = &tool.function.parameters {
                for (key, value) in params {
                    match key.as_str() {
                        "type" => {
                            if let Some(kind) = value.as_str() {
                                schema.kind = kind.to_string();
                            }
                        }
                        "properties" => schema.properties = Some(value.clone()),
                        "required" => schema.required = Some(value.clone()),
                        _ => {
                            schema.extra.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            ClaudeTool {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: schema,
            }
        })
        .collect()
}

fn map_tool_choice(choice: &ToolChoice) -> Option<ClaudeToolChoice> {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(ClaudeToolChoice::Auto),
            "required" => Some(ClaudeToolChoice::Any),
            "none" => Some(ClaudeToolChoice::None),
            _ => None,
        },
        ToolChoice::Named(named) => Some(ClaudeToolChoice::Tool {
            name: named.function.name.clone(),
        }),
    }
}
