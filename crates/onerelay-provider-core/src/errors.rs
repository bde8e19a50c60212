use std::error::Error;
use std::fmt;

use onerelay_transform::TransformError;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The adaptor has no conversion for this request family.
    Unsupported(&'static str),
    InvalidConfig(String),
    InvalidRequest(String),
    Encode(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unsupported(what) => write!(f, "{what} not available"),
            ProviderError::InvalidConfig(msg) => write!(f, "invalid channel config: {msg}"),
            ProviderError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ProviderError::Encode(msg) => write!(f, "encode request failed: {msg}"),
        }
    }
}

impl Error for ProviderError {}

impl From<TransformError> for ProviderError {
    fn from(err: TransformError) -> Self {
        ProviderError::InvalidRequest(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Encode(err.to_string())
    }
}
