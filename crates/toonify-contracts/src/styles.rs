use std::fmt;

use serde::{Deserialize, Serialize};

/// Used whenever a style identifier is not in the catalog.
pub const FALLBACK_INSTRUCTION: &str = "a stylized cartoon character";

/// Compiled-in cartoon presets.
///
/// `Generic` is not part of the selectable catalog; it is what an unknown
/// identifier resolves to, so lookups never fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StylePreset {
    Pixar3d,
    Anime,
    ComicBook,
    Caricature,
    FlatDesign,
    Generic,
}

impl StylePreset {
    /// Selectable presets in display order.
    pub const CATALOG: [StylePreset; 5] = [
        StylePreset::Pixar3d,
        StylePreset::Anime,
        StylePreset::ComicBook,
        StylePreset::Caricature,
        StylePreset::FlatDesign,
    ];

    pub const DEFAULT: StylePreset = StylePreset::Pixar3d;

    pub fn id(self) -> &'static str {
        match self {
            Self::Pixar3d => "pixar3d",
            Self::Anime => "anime",
            Self::ComicBook => "comic_book",
            Self::Caricature => "caricature",
            Self::FlatDesign => "flat_design",
            Self::Generic => "generic",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pixar3d => "3D Pixar Style",
            Self::Anime => "Anime / Manga",
            Self::ComicBook => "Vintage Comic Book",
            Self::Caricature => "Exaggerated Caricature",
            Self::FlatDesign => "Minimalist Flat Design",
            Self::Generic => "Stylized Cartoon",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Self::Pixar3d => {
                "a high-quality 3D render, cute, expressive, Pixar or Disney animation style, soft lighting, vibrant colors, 4k detail"
            }
            Self::Anime => {
                "a high-quality Japanese anime style, clean lines, vibrant cel-shading, studio ghibli or modern shonen aesthetic"
            }
            Self::ComicBook => {
                "a vintage American comic book style, bold black outlines, halftone patterns, pop art aesthetic, dramatic shading"
            }
            Self::Caricature => {
                "a funny artistic caricature, slightly exaggerated features, expressive, hand-drawn artistic style"
            }
            Self::FlatDesign => {
                "a modern minimalist flat design vector illustration, simple shapes, solid colors, clean and sleek"
            }
            Self::Generic => FALLBACK_INSTRUCTION,
        }
    }

    /// Matches an id or label, ignoring case and separators.
    pub fn lookup(identifier: &str) -> Option<Self> {
        let wanted = normalize_identifier(identifier);
        if wanted.is_empty() {
            return None;
        }
        Self::CATALOG.into_iter().find(|preset| {
            normalize_identifier(preset.id()) == wanted
                || normalize_identifier(preset.label()) == wanted
                || preset.aliases().iter().any(|alias| *alias == wanted)
        })
    }

    /// Total lookup: unknown identifiers resolve to [`StylePreset::Generic`].
    pub fn resolve(identifier: &str) -> Self {
        Self::lookup(identifier).unwrap_or_else(|| {
            tracing::warn!(identifier, "unknown style preset; using generic cartoon style");
            Self::Generic
        })
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Pixar3d => &["pixar", "3d", "disney"],
            Self::Anime => &["manga", "ghibli"],
            Self::ComicBook => &["comic", "popart"],
            Self::Caricature => &["exaggerated"],
            Self::FlatDesign => &["flat", "minimalist", "vector"],
            Self::Generic => &[],
        }
    }
}

impl Default for StylePreset {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for StylePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn instruction_for(identifier: &str) -> &'static str {
    StylePreset::resolve(identifier).instruction()
}

fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}
