//! Request image payloads
//!
//! A request carries either one base64 string, which may hold several images
//! joined by [`BATCH_DELIMITER`], or a list of base64 strings. Every decoded
//! buffer must start with a recognized image signature.

use crate::descriptor::ImageSize;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Byte sequence joining several images inside one decoded buffer.
pub const BATCH_DELIMITER: &[u8] = b"\x00\xff\xff\xff\x00";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagePayload {
    Single(String),
    Batch(Vec<String>),
}

impl From<&str> for ImagePayload {
    fn from(value: &str) -> Self {
        ImagePayload::Single(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("Unrecognized image format at batch index {0}")]
    InvalidImageFormat(usize),

    #[error("Cannot read image header: {0}")]
    ImageDamage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Tiff,
    Bmp,
    Webp,
    Ico,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Gif => "gif",
            ImageKind::Tiff => "tiff",
            ImageKind::Bmp => "bmp",
            ImageKind::Webp => "webp",
            ImageKind::Ico => "ico",
        }
    }
}

/// Identify an image by its magic bytes.
pub fn sniff(bytes: &[u8]) -> Option<ImageKind> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageKind::Jpeg),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageKind::Png),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(ImageKind::Gif),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some(ImageKind::Tiff),
        [b'B', b'M', ..] => Some(ImageKind::Bmp),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageKind::Webp),
        [0x00, 0x00, 0x01, 0x00, ..] => Some(ImageKind::Ico),
        _ => None,
    }
}

/// Split one decoded buffer on [`BATCH_DELIMITER`].
pub fn split_batch(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = Vec::new();
    let mut rest = bytes;
    while let Some(pos) = rest
        .windows(BATCH_DELIMITER.len())
        .position(|w| w == BATCH_DELIMITER)
    {
        parts.push(rest[..pos].to_vec());
        rest = &rest[pos + BATCH_DELIMITER.len()..];
    }
    parts.push(rest.to_vec());
    parts
}

/// Join images with [`BATCH_DELIMITER`], the inverse of [`split_batch`].
pub fn join_batch<B: AsRef<[u8]>>(images: &[B]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, image) in images.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(BATCH_DELIMITER);
        }
        out.extend_from_slice(image.as_ref());
    }
    out
}

fn decode_base64(text: &str) -> Result<Vec<u8>, PayloadError> {
    let body = match text.split_once(";base64,") {
        Some((prefix, body)) if prefix.starts_with("data:") => body,
        _ => text,
    };
    let cleaned: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(PayloadError::InvalidBase64("empty payload".to_string()));
    }
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| PayloadError::InvalidBase64(e.to_string()))
}

/// Decode a payload into raw image buffers.
pub fn decode_payload(payload: &ImagePayload) -> Result<Vec<Vec<u8>>, PayloadError> {
    match payload {
        ImagePayload::Single(text) => Ok(split_batch(&decode_base64(text)?)),
        ImagePayload::Batch(items) => {
            if items.is_empty() {
                return Err(PayloadError::InvalidBase64("empty image list".to_string()));
            }
            items.iter().map(|s| decode_base64(s)).collect()
        }
    }
}

/// Sniff every buffer; the first unrecognized one rejects the whole batch.
pub fn sniff_batch(batch: &[Vec<u8>]) -> Result<Vec<ImageKind>, PayloadError> {
    batch
        .iter()
        .enumerate()
        .map(|(i, bytes)| sniff(bytes).ok_or(PayloadError::InvalidImageFormat(i)))
        .collect()
}

/// Read the pixel size from the image header.
pub fn image_size(bytes: &[u8]) -> Result<ImageSize, PayloadError> {
    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PayloadError::ImageDamage(e.to_string()))?
        .into_dimensions()
        .map_err(|e| PayloadError::ImageDamage(e.to_string()))?;
    Ok(ImageSize::new(width, height))
}
