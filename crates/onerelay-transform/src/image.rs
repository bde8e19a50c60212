use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::TransformError;

/// A base64 image ready for a provider `source` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub media_type: String,
    pub data: String,
}

/// Fetches remote images referenced by URL.
#[async_trait::async_trait]
pub trait ImageLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<LoadedImage, TransformError>;
}

/// Resolves an image reference: remote URLs go through `loader`, anything
/// else is treated as a data URI or bare base64 payload.
pub async fn resolve_image(
    url: &str,
    loader: &dyn ImageLoader,
) -> Result<LoadedImage, TransformError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return loader.load(url).await;
    }
    decode_data_uri(url)
}

pub fn decode_data_uri(uri: &str) -> Result<LoadedImage, TransformError> {
    let (header, payload) = match uri.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => (Some(header), payload),
        _ => (None, uri),
    };
    let payload = payload.trim();
    let raw = STANDARD
        .decode(payload)
        .map_err(|err| TransformError::InvalidImage(err.to_string()))?;

    let declared = header
        .and_then(|header| header.strip_prefix("data:"))
        .and_then(|rest| rest.split(';').next())
        .and_then(|mime| mime.strip_prefix("image/"))
        .filter(|format| !format.is_empty());
    let format = match declared {
        Some(format) => format.to_string(),
        None => sniff_image_format(&raw)
            .ok_or_else(|| TransformError::InvalidImage("unknown image format".to_string()))?
            .to_string(),
    };

    Ok(LoadedImage {
        media_type: format!("image/{format}"),
        data: payload.to_string(),
    })
}

pub fn encode_image(media_type: String, bytes: &[u8]) -> LoadedImage {
    LoadedImage {
        media_type,
        data: STANDARD.encode(bytes),
    }
}

pub fn sniff_image_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn data_uri_uses_declared_format() {
        let payload = STANDARD.encode(PNG_HEADER);
        let image = decode_data_uri(&format!("data:image/webp;base64,{payload}")).unwrap();
        assert_eq!(image.media_type, "image/webp");
        assert_eq!(image.data, payload);
    }

    #[test]
    fn bare_base64_is_sniffed() {
        let payload = STANDARD.encode(PNG_HEADER);
        let image = decode_data_uri(&payload).unwrap();
        assert_eq!(image.media_type, "image/png");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode_data_uri("data:image/png;base64,@@@"),
            Err(TransformError::InvalidImage(_))
        ));
    }
}
