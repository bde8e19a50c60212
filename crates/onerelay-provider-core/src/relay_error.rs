use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use onerelay_protocol::claude::ClaudeErrorBody;
use onerelay_protocol::openai::{OpenAIError, OpenAIErrorBody};

use crate::errors::ProviderError;
use crate::upstream::UpstreamFailure;
use crate::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayErrorKind {
    /// Missing pricing or an unusable channel setup.
    Config,
    /// Raised before or around the upstream call by the gateway itself.
    Local,
    Upstream,
    /// The stream broke after bytes reached the caller.
    MidStream,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (status {status}, type {error_type})")]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub status: u16,
    pub code: Option<String>,
    pub error_type: String,
    pub message: String,
    /// Usage accumulated before a mid-stream failure.
    pub usage: Option<Usage>,
}

impl RelayError {
    pub fn local(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Local,
            status,
            code: Some(code.to_string()),
            error_type: "onerelay_error".to_string(),
            message: message.into(),
            usage: None,
        }
    }

    pub fn config(code: &str, message: impl Into<String>) -> Self {
        Self {
            kind: RelayErrorKind::Config,
            ..Self::local(500, code, message)
        }
    }

    pub fn upstream(
        status: u16,
        code: Option<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: RelayErrorKind::Upstream,
            status,
            code,
            error_type: error_type.into(),
            message: message.into(),
            usage: None,
        }
    }

    pub fn mid_stream(
        error_type: impl Into<String>,
        message: impl Into<String>,
        usage: Usage,
    ) -> Self {
        Self {
            kind: RelayErrorKind::MidStream,
            status: 500,
            code: Some("stream_response_error".to_string()),
            error_type: error_type.into(),
            message: message.into(),
            usage: Some(usage),
        }
    }

    /// Local and config errors never reach the health manager.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, RelayErrorKind::Local | RelayErrorKind::Config)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == RelayErrorKind::Upstream
    }

    /// Decodes an upstream error body in OpenAI, Claude or Google shape.
    pub fn from_upstream_body(status: u16, body: &[u8]) -> Self {
        let parsed = serde_json::from_slice::<Value>(body).ok();
        let error = parsed.as_ref().and_then(|value| value.get("error"));

        let (message, error_type, code) = match error {
            Some(Value::Object(obj)) => {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let error_type = obj
                    .get("type")
                    .or_else(|| obj.get("status"))
                    .and_then(Value::as_str)
                    .unwrap_or("upstream_error")
                    .to_string();
                let code = match obj.get("code") {
                    Some(Value::String(code)) => Some(code.clone()),
                    Some(Value::Number(code)) => Some(code.to_string()),
                    _ => None,
                };
                (message, error_type, code)
            }
            Some(Value::String(message)) => (message.clone(), "upstream_error".to_string(), None),
            _ => {
                let message = parsed
                    .as_ref()
                    .and_then(|value| value.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| truncate(&String::from_utf8_lossy(body), 512));
                (message, "upstream_error".to_string(), None)
            }
        };

        let message = if message.is_empty() {
            format!("bad response status code {status}")
        } else {
            message
        };
        Self::upstream(status, code, error_type, message)
    }

    pub fn to_openai_body(&self) -> OpenAIErrorBody {
        OpenAIErrorBody {
            error: OpenAIError {
                message: self.message.clone(),
                kind: self.error_type.clone(),
                param: None,
                code: self.code.clone().map(Value::String),
            },
        }
    }

    pub fn to_claude_body(&self) -> ClaudeErrorBody {
        ClaudeErrorBody::new(self.error_type.clone(), self.message.clone())
    }

    pub fn to_json_bytes(&self, claude: bool) -> Bytes {
        let encoded = if claude {
            serde_json::to_vec(&self.to_claude_body())
        } else {
            serde_json::to_vec(&self.to_openai_body())
        };
        Bytes::from(encoded.unwrap_or_default())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl From<UpstreamFailure> for RelayError {
    fn from(failure: UpstreamFailure) -> Self {
        match failure {
            UpstreamFailure::Http { status, body, .. } => Self::from_upstream_body(status, &body),
            UpstreamFailure::Transport { kind, message } => Self::upstream(
                500,
                Some("do_request_failed".to_string()),
                "upstream_error",
                format!("do request failed ({kind:?}): {message}"),
            ),
        }
    }
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unsupported(_) | ProviderError::InvalidConfig(_) => {
                RelayError::config("convert_request_failed", err.to_string())
            }
            ProviderError::InvalidRequest(_) => {
                RelayError::local(400, "invalid_request", err.to_string())
            }
            ProviderError::Encode(_) => {
                RelayError::local(500, "convert_request_failed", err.to_string())
            }
        }
    }
}
