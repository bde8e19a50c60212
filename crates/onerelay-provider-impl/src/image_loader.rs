use std::time::Duration;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use onerelay_transform::image::{encode_image, sniff_image_format};
use onerelay_transform::{ImageLoader, LoadedImage, TransformError};
use tracing::debug;

const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Downloads remote images referenced in chat messages.
#[derive(Clone)]
pub struct HttpImageLoader {
    client: wreq::Client,
}

impl HttpImageLoader {
    pub fn new(timeout: Duration) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: wreq::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageLoader for HttpImageLoader {
    async fn load(&self, url: &str) -> Result<LoadedImage, TransformError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| TransformError::ImageFetch(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransformError::ImageFetch(format!(
                "image fetch returned {status}"
            )));
        }
        let header_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = resp
            .bytes()
            .await
            .map_err(|err| TransformError::ImageFetch(err.to_string()))?;
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(TransformError::InvalidImage(format!(
                "image exceeds {MAX_IMAGE_BYTES} bytes"
            )));
        }

        let media_type = detect_media_type(header_type.as_deref(), url, &bytes)
            .ok_or_else(|| TransformError::InvalidImage(format!("unknown image type for {url}")))?;
        debug!(event = "image_loaded", media_type = %media_type, bytes = bytes.len());
        Ok(encode_image(media_type, &bytes))
    }
}

/// Response header first, then the URL extension, then magic bytes.
pub fn detect_media_type(header: Option<&str>, url: &str, bytes: &[u8]) -> Option<String> {
    if let Some(header) = header.filter(|value| value.starts_with("image/")) {
        return Some(header.to_string());
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(guess) = mime_guess::from_path(path).first()
        && guess.type_() == mime_guess::mime::IMAGE
    {
        return Some(guess.essence_str().to_string());
    }
    sniff_image_format(bytes).map(|format| format!("image/{format}"))
}
