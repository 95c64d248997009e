//! Variant catalog and quality policy.
//!
//! The catalog is built once at start-up from [`CatalogConfig`] and shared by
//! the dispatcher, the variant worker and the single-stage processor, so the
//! stage that picks widths and the stage that encodes them can never disagree.
//! Everything here is pure.

use crate::config::{CatalogConfig, TierConfig};
use crate::variant::{target_height, OutputFormat, VariantSpec};
use serde::Serialize;
use thiserror::Error;

/// Highest WebP method (effort) libwebp accepts
pub const MAX_WEBP_EFFORT: u8 = 6;
/// Highest AVIF effort; mapped onto the encoder's speed scale
pub const MAX_AVIF_EFFORT: u8 = 9;

/// Errors raised while validating a catalog configuration
#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("Catalog contains no widths")]
    Empty,

    #[error("Catalog width must be positive")]
    ZeroWidth,

    #[error("Tier thresholds must be increasing: small {small} >= medium {medium}")]
    UnorderedTiers { small: u32, medium: u32 },

    #[error("Quality {0} is outside 0-100")]
    QualityOutOfRange(u8),

    #[error("WebP effort {0} exceeds {MAX_WEBP_EFFORT}")]
    WebpEffortOutOfRange(u8),

    #[error("AVIF effort {0} exceeds {MAX_AVIF_EFFORT}")]
    AvifEffortOutOfRange(u8),

    #[error("Encoder profile must not be empty")]
    MissingEncoderProfile,
}

/// Size class a width falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Small,
    Medium,
    Large,
}

/// Encoder parameters for one width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualitySettings {
    /// Compression quality, 0-100
    pub quality: u8,
    /// WebP method, 0-6
    pub webp_effort: u8,
    /// AVIF effort, 0-9
    pub avif_effort: u8,
}

/// Immutable catalog of target widths plus the quality policy
#[derive(Debug, Clone, PartialEq)]
pub struct VariantCatalog {
    widths: Vec<u32>,
    small_max_width: u32,
    medium_max_width: u32,
    small: TierConfig,
    medium: TierConfig,
    large: TierConfig,
    avif_effort_bonus: u8,
    avif_min_width: u32,
    encoder_profile: String,
}

impl VariantCatalog {
    /// Build and validate a catalog. Thumbnail and device widths are merged,
    /// deduplicated and sorted ascending.
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut widths: Vec<u32> = config
            .thumbnail_widths
            .iter()
            .chain(config.device_widths.iter())
            .copied()
            .collect();
        widths.sort_unstable();
        widths.dedup();

        if widths.is_empty() {
            return Err(CatalogError::Empty);
        }
        if widths[0] == 0 {
            return Err(CatalogError::ZeroWidth);
        }
        if config.small_max_width >= config.medium_max_width {
            return Err(CatalogError::UnorderedTiers {
                small: config.small_max_width,
                medium: config.medium_max_width,
            });
        }
        for tier in [&config.small, &config.medium, &config.large] {
            if tier.quality > 100 {
                return Err(CatalogError::QualityOutOfRange(tier.quality));
            }
            if tier.effort > MAX_WEBP_EFFORT {
                return Err(CatalogError::WebpEffortOutOfRange(tier.effort));
            }
            let avif_effort = tier.effort.saturating_add(config.avif_effort_bonus);
            if avif_effort > MAX_AVIF_EFFORT {
                return Err(CatalogError::AvifEffortOutOfRange(avif_effort));
            }
        }
        if config.encoder_profile.trim().is_empty() {
            return Err(CatalogError::MissingEncoderProfile);
        }

        Ok(Self {
            widths,
            small_max_width: config.small_max_width,
            medium_max_width: config.medium_max_width,
            small: config.small.clone(),
            medium: config.medium.clone(),
            large: config.large.clone(),
            avif_effort_bonus: config.avif_effort_bonus,
            avif_min_width: config.avif_min_width,
            encoder_profile: config.encoder_profile.clone(),
        })
    }

    /// All catalog widths, ascending
    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    pub fn is_catalog_width(&self, width: u32) -> bool {
        self.widths.binary_search(&width).is_ok()
    }

    /// Catalog widths that do not upscale an original of `original_width`.
    /// Empty when the original is narrower than every catalog width.
    pub fn applicable_sizes(&self, original_width: u32) -> Vec<u32> {
        self.widths
            .iter()
            .copied()
            .take_while(|w| *w <= original_width)
            .collect()
    }

    pub fn tier_for(&self, width: u32) -> QualityTier {
        if width <= self.small_max_width {
            QualityTier::Small
        } else if width <= self.medium_max_width {
            QualityTier::Medium
        } else {
            QualityTier::Large
        }
    }

    pub fn quality_for(&self, width: u32) -> QualitySettings {
        let tier = match self.tier_for(width) {
            QualityTier::Small => &self.small,
            QualityTier::Medium => &self.medium,
            QualityTier::Large => &self.large,
        };

        QualitySettings {
            quality: tier.quality,
            webp_effort: tier.effort,
            avif_effort: tier.effort + self.avif_effort_bonus,
        }
    }

    /// WebP always; AVIF only from `avif_min_width` up
    pub fn formats_for(&self, width: u32) -> Vec<OutputFormat> {
        OutputFormat::ALL
            .into_iter()
            .filter(|format| match format {
                OutputFormat::Webp => true,
                OutputFormat::Avif => width >= self.avif_min_width,
            })
            .collect()
    }

    pub fn variant_spec(&self, width: u32, original_width: u32, original_height: u32) -> VariantSpec {
        VariantSpec {
            width,
            height: target_height(width, original_width, original_height),
            quality: self.quality_for(width),
            formats: self.formats_for(width),
        }
    }

    /// Identifier of the pinned encoder libraries and parameters
    pub fn encoder_profile(&self) -> &str {
        &self.encoder_profile
    }
}

impl Default for VariantCatalog {
    fn default() -> Self {
        Self::from_config(&CatalogConfig::default())
            .unwrap_or_else(|e| unreachable!("default catalog is valid: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_widths() {
        let catalog = VariantCatalog::default();
        assert_eq!(
            catalog.widths(),
            &[16, 32, 48, 64, 96, 128, 256, 384, 640, 828, 1200, 1920, 2048, 3840]
        );
    }

    #[test]
    fn test_applicable_sizes_for_1200_wide_source() {
        let catalog = VariantCatalog::default();
        assert_eq!(
            catalog.applicable_sizes(1200),
            vec![16, 32, 48, 64, 96, 128, 256, 384, 640, 828, 1200]
        );
    }

    #[test]
    fn test_applicable_sizes_empty_for_tiny_source() {
        let catalog = VariantCatalog::default();
        assert!(catalog.applicable_sizes(15).is_empty());
        assert_eq!(catalog.applicable_sizes(50), vec![16, 32, 48]);
        assert_eq!(catalog.applicable_sizes(16), vec![16]);
    }

    #[test]
    fn test_quality_tiers() {
        let catalog = VariantCatalog::default();
        assert_eq!(catalog.quality_for(16).quality, 80);
        assert_eq!(catalog.quality_for(384).quality, 80);
        assert_eq!(catalog.quality_for(385).quality, 85);
        assert_eq!(catalog.quality_for(1080).quality, 85);
        assert_eq!(catalog.quality_for(1081).quality, 90);
        assert_eq!(catalog.quality_for(3840).quality, 90);
    }

    #[test]
    fn test_avif_effort_includes_bonus() {
        let catalog = VariantCatalog::default();
        for width in catalog.widths() {
            let settings = catalog.quality_for(*width);
            assert_eq!(
                settings.avif_effort,
                settings.webp_effort + CatalogConfig::default().avif_effort_bonus
            );
        }
    }

    #[test]
    fn test_format_gating() {
        let catalog = VariantCatalog::default();
        assert_eq!(catalog.formats_for(384), vec![OutputFormat::Webp]);
        assert_eq!(catalog.formats_for(639), vec![OutputFormat::Webp]);
        assert_eq!(
            catalog.formats_for(640),
            vec![OutputFormat::Webp, OutputFormat::Avif]
        );
    }

    #[test]
    fn test_variant_spec_counts_for_1200x800() {
        let catalog = VariantCatalog::default();
        let specs: Vec<_> = catalog
            .applicable_sizes(1200)
            .into_iter()
            .map(|w| catalog.variant_spec(w, 1200, 800))
            .collect();

        let webp = specs.iter().filter(|s| s.formats.contains(&OutputFormat::Webp)).count();
        let avif: Vec<u32> = specs
            .iter()
            .filter(|s| s.formats.contains(&OutputFormat::Avif))
            .map(|s| s.width)
            .collect();

        assert_eq!(webp, 11);
        assert_eq!(avif, vec![640, 828, 1200]);
        assert_eq!(specs.last().map(|s| s.height), Some(800));
    }

    #[test]
    fn test_widths_deduplicated_and_sorted() {
        let config = CatalogConfig {
            thumbnail_widths: vec![64, 16, 640],
            device_widths: vec![1200, 640],
            ..CatalogConfig::default()
        };
        let catalog = VariantCatalog::from_config(&config).unwrap();
        assert_eq!(catalog.widths(), &[16, 64, 640, 1200]);
        assert!(catalog.is_catalog_width(640));
        assert!(!catalog.is_catalog_width(641));
    }

    #[test]
    fn test_invalid_catalogs_rejected() {
        let empty = CatalogConfig {
            thumbnail_widths: vec![],
            device_widths: vec![],
            ..CatalogConfig::default()
        };
        assert_eq!(VariantCatalog::from_config(&empty), Err(CatalogError::Empty));

        let zero = CatalogConfig {
            thumbnail_widths: vec![0, 16],
            ..CatalogConfig::default()
        };
        assert_eq!(VariantCatalog::from_config(&zero), Err(CatalogError::ZeroWidth));

        let unordered = CatalogConfig {
            small_max_width: 2000,
            ..CatalogConfig::default()
        };
        assert!(matches!(
            VariantCatalog::from_config(&unordered),
            Err(CatalogError::UnorderedTiers { .. })
        ));

        let mut too_much_effort = CatalogConfig::default();
        too_much_effort.large.effort = 6;
        too_much_effort.avif_effort_bonus = 5;
        assert_eq!(
            VariantCatalog::from_config(&too_much_effort),
            Err(CatalogError::AvifEffortOutOfRange(11))
        );
    }
}
