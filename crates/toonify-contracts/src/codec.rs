use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Raster types accepted for upload and expected back from a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/webp")]
    Webp,
    #[serde(rename = "image/gif")]
    Gif,
}

impl MediaType {
    pub const SUPPORTED: [MediaType; 4] = [
        MediaType::Jpeg,
        MediaType::Png,
        MediaType::Webp,
        MediaType::Gif,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Webp => ImageFormat::WebP,
            Self::Gif => ImageFormat::Gif,
        }
    }

    /// Lenient parse of a MIME string (`image/JPG; charset=binary` is fine).
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match lowered.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" | "image/x-png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            "image/gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Identify the container from its magic bytes.
    pub fn sniff(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let format = image::guess_format(bytes).map_err(|_| DecodeError::Unrecognized)?;
        match format {
            ImageFormat::Jpeg => Ok(Self::Jpeg),
            ImageFormat::Png => Ok(Self::Png),
            ImageFormat::WebP => Ok(Self::Webp),
            ImageFormat::Gif => Ok(Self::Gif),
            other => Err(DecodeError::Unsupported(
                other
                    .extensions_str()
                    .first()
                    .copied()
                    .unwrap_or("unknown")
                    .to_string(),
            )),
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-selected photo, held in memory in both raw and transmittable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    raw_bytes: Vec<u8>,
    media_type: MediaType,
    encoded_payload: String,
}

impl UploadedImage {
    /// The container is sniffed from the bytes and the image is fully decoded
    /// once; a declared type that disagrees with the content is ignored.
    pub fn from_bytes(raw_bytes: Vec<u8>, declared: Option<&str>) -> Result<Self, DecodeError> {
        let media_type = MediaType::sniff(&raw_bytes)?;
        image::load_from_memory_with_format(&raw_bytes, media_type.image_format()).map_err(
            |err| DecodeError::Corrupt {
                media_type: media_type.as_str(),
                detail: err.to_string(),
            },
        )?;
        if let Some(declared) = declared {
            if MediaType::parse(declared) != Some(media_type) {
                tracing::debug!(
                    declared,
                    sniffed = media_type.as_str(),
                    "declared media type does not match image content"
                );
            }
        }
        let encoded_payload = BASE64.encode(&raw_bytes);
        Ok(Self {
            raw_bytes,
            media_type,
            encoded_payload,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, DecodeError> {
        let bytes = std::fs::read(path)?;
        let declared = media_type_for_path(path).map(MediaType::as_str);
        Self::from_bytes(bytes, declared)
    }

    pub fn from_data_url(raw: &str) -> Result<Self, DecodeError> {
        let (declared, bytes) = parse_data_url(raw)?;
        Self::from_bytes(bytes, Some(&declared))
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw_bytes
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn encoded_payload(&self) -> &str {
        &self.encoded_payload
    }

    /// Self-contained reference that renders without touching the source file.
    pub fn preview_reference(&self) -> String {
        to_data_url(self.media_type.as_str(), &self.encoded_payload)
    }
}

pub fn encode(raw_bytes: Vec<u8>, declared: Option<&str>) -> Result<UploadedImage, DecodeError> {
    UploadedImage::from_bytes(raw_bytes, declared)
}

pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(BASE64.decode(encoded.trim().as_bytes())?)
}

pub fn to_data_url(media_type: &str, payload: &str) -> String {
    format!("data:{media_type};base64,{payload}")
}

/// Splits `data:<mediaType>;base64,<payload>` into its media type and bytes.
pub fn parse_data_url(raw: &str) -> Result<(String, Vec<u8>), DecodeError> {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("data:") else {
        return Err(DecodeError::MalformedDataUrl(
            "missing data: prefix".to_string(),
        ));
    };
    let Some((media_type, payload)) = rest.split_once(";base64,") else {
        return Err(DecodeError::MalformedDataUrl(
            "missing ;base64, separator".to_string(),
        ));
    };
    if media_type.is_empty() || payload.is_empty() {
        return Err(DecodeError::MalformedDataUrl(
            "empty media type or payload".to_string(),
        ));
    }
    Ok((media_type.to_string(), decode_payload(payload)?))
}

pub fn media_type_for_path(path: &Path) -> Option<MediaType> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some(MediaType::Jpeg),
        "png" => Some(MediaType::Png),
        "webp" => Some(MediaType::Webp),
        "gif" => Some(MediaType::Gif),
        _ => None,
    }
}
