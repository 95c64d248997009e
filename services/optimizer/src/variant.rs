//! Variant value types and the deterministic storage layout.
//!
//! Every stored variant lives at `processed/w<width>/<basename>.<format>`.
//! The delivery layer routes requests by this layout, so the key derivation
//! here is a contract, not an implementation detail.

use crate::catalog::QualitySettings;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix under which every derived variant is written
pub const PROCESSED_PREFIX: &str = "processed/";

/// Encoded output format of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Webp,
    Avif,
}

impl OutputFormat {
    /// All formats in the order they are produced
    pub const ALL: [OutputFormat; 2] = [OutputFormat::Webp, OutputFormat::Avif];

    /// File extension used in the storage key
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Avif => "avif",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Webp => "image/webp",
            OutputFormat::Avif => "image/avif",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// An uploaded original, identified by its location and decoded dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceImage {
    pub bucket: String,
    pub key: String,
    pub width: u32,
    pub height: u32,
}

/// Everything needed to render one width of a source image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub width: u32,
    pub height: u32,
    pub quality: QualitySettings,
    pub formats: Vec<OutputFormat>,
}

/// One encoded rendition, ready to be written to storage
#[derive(Debug, Clone, PartialEq)]
pub struct VariantObject {
    pub key: String,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub data: Bytes,
}

impl VariantObject {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Descriptive object metadata, all values as decimal strings
    pub fn metadata(&self, encoder_profile: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("width".to_string(), self.width.to_string()),
            ("height".to_string(), self.height.to_string()),
            ("size".to_string(), self.size_bytes().to_string()),
            ("quality".to_string(), self.quality.to_string()),
            ("encoder-profile".to_string(), encoder_profile.to_string()),
        ])
    }
}

/// Height that preserves the original aspect ratio at `target_width`.
///
/// Computes `round(target_width * original_height / original_width)` in
/// integer arithmetic, rounding halves up, never returning zero.
pub fn target_height(target_width: u32, original_width: u32, original_height: u32) -> u32 {
    if original_width == 0 {
        return 1;
    }

    let numerator = 2 * target_width as u64 * original_height as u64 + original_width as u64;
    let height = numerator / (2 * original_width as u64);
    height.clamp(1, u32::MAX as u64) as u32
}

/// Storage key for a variant of `source_key`.
///
/// Only the basename of the source survives; its extension (if any) is
/// replaced by the format's extension.
pub fn variant_key(source_key: &str, width: u32, format: OutputFormat) -> String {
    let basename = source_key.rsplit('/').next().unwrap_or(source_key);
    let stem = match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => basename,
    };

    format!(
        "{prefix}w{width}/{stem}.{ext}",
        prefix = PROCESSED_PREFIX,
        width = width,
        stem = stem,
        ext = format.extension()
    )
}

/// Whether a key belongs to the derived variant tree
pub fn is_processed_key(key: &str) -> bool {
    key.starts_with(PROCESSED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_key_replaces_extension() {
        assert_eq!(
            variant_key("uploads/2024/name.jpg", 640, OutputFormat::Webp),
            "processed/w640/name.webp"
        );
        assert_eq!(
            variant_key("name.png", 1200, OutputFormat::Avif),
            "processed/w1200/name.avif"
        );
    }

    #[test]
    fn test_variant_key_edge_cases() {
        assert_eq!(
            variant_key("uploads/archive.tar.gz", 16, OutputFormat::Webp),
            "processed/w16/archive.tar.webp"
        );
        assert_eq!(
            variant_key("uploads/README", 32, OutputFormat::Webp),
            "processed/w32/README.webp"
        );
        assert_eq!(
            variant_key("uploads/.hidden", 32, OutputFormat::Webp),
            "processed/w32/.hidden.webp"
        );
        assert_eq!(
            variant_key("uploads/my photo.jpeg", 48, OutputFormat::Avif),
            "processed/w48/my photo.avif"
        );
    }

    #[test]
    fn test_target_height_preserves_aspect() {
        assert_eq!(target_height(640, 1200, 800), 427);
        assert_eq!(target_height(1200, 1200, 800), 800);
        assert_eq!(target_height(16, 1200, 800), 11);
        assert_eq!(target_height(16, 4000, 10), 1);
        // exact half rounds up: 3 * 1 / 2 = 1.5
        assert_eq!(target_height(3, 2, 1), 2);
    }

    #[test]
    fn test_target_height_within_rounding_tolerance() {
        for (ow, oh) in [(1200u32, 800u32), (1920, 1080), (3000, 4000), (1001, 333)] {
            for w in [16u32, 96, 384, 640, 828] {
                let expected = (w as f64 * oh as f64 / ow as f64).round();
                let h = target_height(w, ow, oh) as f64;
                assert!((h - expected).abs() <= 1.0, "{}x{} at {}", ow, oh, w);
            }
        }
    }

    #[test]
    fn test_metadata_values_are_decimal_strings() {
        let variant = VariantObject {
            key: "processed/w640/a.webp".to_string(),
            format: OutputFormat::Webp,
            width: 640,
            height: 427,
            quality: 85,
            data: Bytes::from_static(&[0u8; 10]),
        };

        let metadata = variant.metadata("v1");
        assert_eq!(metadata["width"], "640");
        assert_eq!(metadata["height"], "427");
        assert_eq!(metadata["size"], "10");
        assert_eq!(metadata["quality"], "85");
        assert_eq!(metadata["encoder-profile"], "v1");
    }

    #[test]
    fn test_output_format_content_types() {
        assert_eq!(OutputFormat::Webp.content_type(), "image/webp");
        assert_eq!(OutputFormat::Avif.content_type(), "image/avif");
        assert_eq!(OutputFormat::Avif.to_string(), "avif");
        assert!(is_processed_key("processed/w16/a.webp"));
        assert!(!is_processed_key("uploads/a.png"));
    }
}
