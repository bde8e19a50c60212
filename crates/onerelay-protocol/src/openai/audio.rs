use serde::{Deserialize, Serialize};

use crate::JsonObject;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// Finds the value of a plain text field in a `multipart/form-data` body.
///
/// Transcription uploads are forwarded byte for byte; only the model name is
/// needed for routing and billing.
pub fn multipart_field(content_type: &str, body: &[u8], field: &str) -> Option<String> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary="))?
        .trim_matches('"');
    let delimiter = format!("--{boundary}");
    let text = String::from_utf8_lossy(body);
    let needle = format!("name=\"{field}\"");

    text.split(delimiter.as_str())
        .filter(|section| section.contains(needle.as_str()))
        .find_map(|section| {
            let (_, value) = section
                .split_once("\r\n\r\n")
                .or_else(|| section.split_once("\n\n"))?;
            let value = value.trim_end_matches("--").trim();
            (!value.is_empty()).then(|| value.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_field() {
        let body = "--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.mp3\"\r\n\r\nBINARY\r\n--XyZ\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--XyZ--\r\n";
        let model = multipart_field("multipart/form-data; boundary=XyZ", body.as_bytes(), "model");
        assert_eq!(model.as_deref(), Some("whisper-1"));
        assert!(multipart_field("multipart/form-data; boundary=XyZ", body.as_bytes(), "language").is_none());
    }
}
