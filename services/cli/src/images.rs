//! Loading local image files as inline attachments for vision turns.

use base64::{Engine as _, engine::general_purpose};
use std::path::Path;
use unichat_core::protocol::ImageAttachment;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported image type for {0}; expected png, jpg, jpeg, gif or webp")]
    UnsupportedType(String),
    #[error("Image {0} is empty")]
    Empty(String),
}

/// Maps a file extension to the MIME type sent to the vision endpoint.
pub fn mime_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Reads and base64-encodes an image file.
pub fn load_image(path: &Path) -> Result<ImageAttachment, ImageError> {
    let display = path.display().to_string();
    let mime_type =
        mime_type_for(path).ok_or_else(|| ImageError::UnsupportedType(display.clone()))?;

    let bytes = std::fs::read(path).map_err(|source| ImageError::Io {
        path: display.clone(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(ImageError::Empty(display));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(display);

    Ok(ImageAttachment {
        base64: general_purpose::STANDARD.encode(&bytes),
        mime_type: mime_type.to_string(),
        name,
    })
}
