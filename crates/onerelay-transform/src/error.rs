#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid image data: {0}")]
    InvalidImage(String),
    #[error("fetch image failed: {0}")]
    ImageFetch(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
