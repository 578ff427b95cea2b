//! Image ingestion: raw bytes in, grayscale raster out.
//!
//! Accepts PNG, JPEG, BMP, and WebP (whatever the enabled `image`
//! decoders support). Size limits are enforced before and during
//! decoding so a hostile header cannot force a huge allocation.

use std::io::Cursor;

use image::{ColorType, GrayImage, ImageError, ImageReader, Limits};

use crate::config::PipelineConfig;
use crate::types::DecodeError;

/// A decoded sheet: grayscale pixels plus the color layout of the source.
#[derive(Debug, Clone)]
pub struct AnswerSheetImage {
    /// Luminance, one byte per pixel.
    pub pixels: GrayImage,
    /// Color type of the encoded source before conversion.
    pub source_color: ColorType,
}

/// Decode raw image bytes and convert to grayscale.
///
/// `content_type`, when given, must be an `image/*` media type (matched
/// case-insensitively, parameters ignored). The actual format is always
/// sniffed from the bytes. Color images are converted with the
/// `image` crate's luminance weights.
///
/// # Errors
///
/// - [`DecodeError::EmptyInput`] if `bytes` is empty.
/// - [`DecodeError::InputTooLarge`] above `config.max_input_bytes`.
/// - [`DecodeError::UnsupportedContentType`] for a non-image media type.
/// - [`DecodeError::ImageTooLarge`] if either side exceeds
///   `config.max_dimension`.
/// - [`DecodeError::Format`] for truncated, corrupt, or unsupported data.
pub fn decode(
    bytes: &[u8],
    content_type: Option<&str>,
    config: &PipelineConfig,
) -> Result<AnswerSheetImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }
    if bytes.len() > config.max_input_bytes {
        return Err(DecodeError::InputTooLarge {
            bytes: bytes.len(),
            max: config.max_input_bytes,
        });
    }
    if let Some(declared) = content_type {
        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !essence.starts_with("image/") {
            return Err(DecodeError::UnsupportedContentType(declared.to_owned()));
        }
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(ImageError::IoError)?;
    reader.limits(limits);

    let image = reader.decode().map_err(|e| match e {
        ImageError::Limits(_) => DecodeError::ImageTooLarge {
            max: config.max_dimension,
        },
        other => DecodeError::Format(other),
    })?;
    Ok(AnswerSheetImage {
        source_color: image.color(),
        pixels: image.to_luma8(),
    })
}
