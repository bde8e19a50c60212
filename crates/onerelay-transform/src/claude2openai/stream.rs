use std::collections::BTreeMap;

use onerelay_protocol::claude::ClaudeErrorDetail;
use onerelay_protocol::claude::messages::{ClaudeUsage, ContentBlock};
use onerelay_protocol::claude::stream::{BlockDelta, StreamEvent};
use onerelay_protocol::openai::Usage;
use onerelay_protocol::openai::chat::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallDelta, chunk_object,
};

use crate::claude2openai::response::{map_stop_reason, usage_from_claude};

/// Kind of the content block most recently opened in the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LastMessageType {
    #[default]
    None,
    Text,
    Tools,
    Thinking,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutput {
    Chunk(ChatCompletionChunk),
    /// Nothing to forward for this event.
    Skip,
    Stop,
    Error(ClaudeErrorDetail),
}

/// Translates a Claude Messages event stream into OpenAI chat completion chunks.
#[derive(Debug, Clone)]
pub struct ClaudeStreamState {
    id: String,
    model: String,
    created: i64,
    usage: ClaudeUsage,
    tool_indices: BTreeMap<u32, u32>,
    response_text: String,
    last_message_type: LastMessageType,
    finish_reason: Option<String>,
}

impl ClaudeStreamState {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            usage: ClaudeUsage::default(),
            tool_indices: BTreeMap::new(),
            response_text: String::new(),
            last_message_type: LastMessageType::None,
            finish_reason: None,
        }
    }

    /// Parses one SSE `data:` payload; undecodable frames surface as stream errors.
    pub fn handle_data(&mut self, data: &str) -> StreamOutput {
        match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => self.handle_event(event),
            Err(err) => StreamOutput::Error(ClaudeErrorDetail {
                kind: "stream_response_error".to_string(),
                message: format!("undecodable stream frame: {err}"),
            }),
        }
    }

    pub fn handle_event(&mut self, event: StreamEvent) -> StreamOutput {
        match event {
            StreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id;
                }
                if !message.model.is_empty() {
                    self.model = message.model;
                }
                self.usage = message.usage;
                StreamOutput::Chunk(self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        ..Default::default()
                    },
                    None,
                ))
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.block_start(index, content_block),
            StreamEvent::ContentBlockDelta { index, delta } => self.block_delta(index, delta),
            StreamEvent::MessageDelta { delta, usage } => {
                if usage.input_tokens > 0 {
                    self.usage.input_tokens = usage.input_tokens;
                }
                if usage.cache_read_input_tokens > 0 {
                    self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
                }
                if usage.cache_creation_input_tokens > 0 {
                    self.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
                }
                self.usage.output_tokens = usage.output_tokens;

                match delta.stop_reason.as_deref().map(map_stop_reason) {
                    Some(reason) => {
                        self.finish_reason = Some(reason.clone());
                        StreamOutput::Chunk(self.chunk(ChunkDelta::default(), Some(reason)))
                    }
                    None => StreamOutput::Skip,
                }
            }
            StreamEvent::MessageStop => StreamOutput::Stop,
            StreamEvent::Error { error } => StreamOutput::Error(error),
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping | StreamEvent::Unknown => {
                StreamOutput::Skip
            }
        }
    }

    fn block_start(&mut self, index: u32, block: ContentBlock) -> StreamOutput {
        match block {
            ContentBlock::ToolUse { id, name, .. } => {
                self.last_message_type = LastMessageType::Tools;
                let tool_index = self.tool_indices.len() as u32;
                self.tool_indices.insert(index, tool_index);
                StreamOutput::Chunk(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: tool_index,
                            id: Some(id),
                            kind: Some("function".to_string()),
                            function: Some(FunctionCallDelta {
                                name: Some(name),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                ))
            }
            ContentBlock::Text { .. } => {
                self.last_message_type = LastMessageType::Text;
                StreamOutput::Skip
            }
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {
                self.last_message_type = LastMessageType::Thinking;
                StreamOutput::Skip
            }
            _ => StreamOutput::Skip,
        }
    }

    fn block_delta(&mut self, index: u32, delta: BlockDelta) -> StreamOutput {
        let delta = match delta {
            BlockDelta::TextDelta { text } => {
                self.response_text.push_str(&text);
                ChunkDelta {
                    content: Some(text),
                    ..Default::default()
                }
            }
            BlockDelta::InputJsonDelta { partial_json } => {
                let Some(tool_index) = self.tool_indices.get(&index).copied() else {
                    return StreamOutput::Skip;
                };
                ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: tool_index,
                        function: Some(FunctionCallDelta {
                            name: None,
                            arguments: Some(partial_json),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }
            }
            BlockDelta::ThinkingDelta { thinking } => {
                self.response_text.push_str(&thinking);
                ChunkDelta {
                    reasoning_content: Some(thinking),
                    ..Default::default()
                }
            }
            // Signatures are opaque; a newline keeps reasoning segments apart.
            BlockDelta::SignatureDelta { .. } => ChunkDelta {
                reasoning_content: Some("\n".to_string()),
                ..Default::default()
            },
            BlockDelta::CitationsDelta { .. } | BlockDelta::Unknown => return StreamOutput::Skip,
        };
        StreamOutput::Chunk(self.chunk(delta, None))
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: chunk_object(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// The trailing usage-only chunk sent when the caller asked for `include_usage`.
    pub fn usage_chunk(&self, usage: Usage) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: chunk_object(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: Some(usage),
        }
    }

    pub fn usage(&self) -> Usage {
        usage_from_claude(&self.usage)
    }

    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    pub fn last_message_type(&self) -> LastMessageType {
        self.last_message_type
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}
