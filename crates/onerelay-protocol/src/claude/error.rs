use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaudeErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: ClaudeErrorDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeErrorDetail {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl ClaudeErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            error: ClaudeErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}
