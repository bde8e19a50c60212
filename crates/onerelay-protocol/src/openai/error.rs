use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{"error": {...}}` envelope used by OpenAI-compatible endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIErrorBody {
    pub error: OpenAIError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAIError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub param: Option<String>,
    /// Providers send strings or numbers here.
    #[serde(default)]
    pub code: Option<Value>,
}

impl OpenAIError {
    pub fn code_str(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(code)) => Some(code.clone()),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => None,
        }
    }
}
