use serde::{Deserialize, Serialize};

use crate::codec::{self, MediaType, UploadedImage};
use crate::error::DecodeError;
use crate::styles::StylePreset;

/// Media type assumed when a model returns image data without declaring one.
pub const DEFAULT_RESULT_MEDIA_TYPE: &str = "image/png";

pub fn compose_prompt(instruction: &str) -> String {
    format!(
        "Transform the person in this image into {instruction}. Maintain the gender, hair color, \
         and key facial characteristics (like glasses or facial hair) so they are recognizable, \
         but fully stylized as a cartoon. Return ONLY the image."
    )
}

/// Everything a provider needs for one attempt. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub image_encoding: String,
    pub media_type: MediaType,
    pub composed_prompt: String,
    pub style: StylePreset,
}

impl GenerationRequest {
    pub fn new(image: &UploadedImage, style: StylePreset) -> Self {
        Self {
            image_encoding: image.encoded_payload().to_string(),
            media_type: image.media_type(),
            composed_prompt: compose_prompt(style.instruction()),
            style,
        }
    }
}

/// What a successful provider call hands back before the session attaches context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub result_encoding: String,
    pub result_media_type: String,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub result_encoding: String,
    pub result_media_type: String,
    pub style_preset_used: StylePreset,
    pub model: String,
    pub provider: String,
    pub prompt: String,
}

impl GenerationResult {
    pub fn from_output(output: GenerationOutput, style: StylePreset, prompt: String) -> Self {
        Self {
            result_encoding: output.result_encoding,
            result_media_type: output.result_media_type,
            style_preset_used: style,
            model: output.model,
            provider: output.provider,
            prompt,
        }
    }

    pub fn media_type(&self) -> Option<MediaType> {
        MediaType::parse(&self.result_media_type)
    }

    pub fn data_url(&self) -> String {
        codec::to_data_url(&self.result_media_type, &self.result_encoding)
    }

    pub fn decode_bytes(&self) -> Result<Vec<u8>, DecodeError> {
        codec::decode_payload(&self.result_encoding)
    }
}

#[cfg(test)]
mod tests {
    use image::ImageFormat;

    use super::*;
    use crate::codec::fixtures::encoded_image;
    use crate::styles::FALLBACK_INSTRUCTION;

    #[test]
    fn prompt_contains_only_the_chosen_fragment() {
        for preset in StylePreset::CATALOG {
            let prompt = compose_prompt(preset.instruction());
            assert!(prompt.contains(preset.instruction()));
            for other in StylePreset::CATALOG.iter().filter(|other| **other != preset) {
                assert!(!prompt.contains(other.instruction()));
            }
            assert!(prompt.starts_with("Transform the person in this image into "));
            assert!(prompt.ends_with("Return ONLY the image."));
        }
    }

    #[test]
    fn generic_prompt_uses_fallback_fragment() {
        let prompt = compose_prompt(StylePreset::resolve("oil painting").instruction());
        assert!(prompt.contains(FALLBACK_INSTRUCTION));
    }

    #[test]
    fn request_is_derived_from_image_and_style() -> anyhow::Result<()> {
        let image = UploadedImage::from_bytes(encoded_image(ImageFormat::Png, 8, 8), None)?;
        let request = GenerationRequest::new(&image, StylePreset::ComicBook);
        assert_eq!(request.image_encoding, image.encoded_payload());
        assert_eq!(request.media_type, MediaType::Png);
        assert_eq!(request, GenerationRequest::new(&image, StylePreset::ComicBook));
        assert!(request
            .composed_prompt
            .contains(StylePreset::ComicBook.instruction()));
        Ok(())
    }

    #[test]
    fn result_presents_as_data_url_and_decodes() -> anyhow::Result<()> {
        let bytes = encoded_image(ImageFormat::Png, 4, 4);
        let image = UploadedImage::from_bytes(bytes.clone(), None)?;
        let result = GenerationResult::from_output(
            GenerationOutput {
                result_encoding: image.encoded_payload().to_string(),
                result_media_type: "image/png".to_string(),
                model: "dryrun-image-1".to_string(),
                provider: "dryrun".to_string(),
            },
            StylePreset::Anime,
            compose_prompt(StylePreset::Anime.instruction()),
        );
        assert!(result.data_url().starts_with("data:image/png;base64,"));
        assert_eq!(result.media_type(), Some(MediaType::Png));
        assert_eq!(result.decode_bytes()?, bytes);
        Ok(())
    }
}
