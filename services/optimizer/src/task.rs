//! The per-width processing task carried on the tasks topic.

use crate::catalog::VariantCatalog;
use crate::error::TaskError;
use crate::variant::{SourceImage, VariantSpec};
use serde::{Deserialize, Serialize};

/// Unit of queued work: one source image at one target width.
///
/// Self-describing; a worker needs nothing beyond this and the shared
/// catalog to render and store the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTask {
    pub source_bucket: String,
    pub source_key: String,
    pub target_size: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ProcessingTask {
    pub fn new(source: &SourceImage, target_size: u32) -> Self {
        Self {
            source_bucket: source.bucket.clone(),
            source_key: source.key.clone(),
            target_size,
            original_width: source.width,
            original_height: source.height,
        }
    }

    /// Reject tasks no worker could process correctly
    pub fn validate(&self, catalog: &VariantCatalog) -> Result<(), TaskError> {
        if self.source_bucket.is_empty() {
            return Err(TaskError::MissingField("sourceBucket"));
        }
        if self.source_key.is_empty() {
            return Err(TaskError::MissingField("sourceKey"));
        }
        if self.original_width == 0 || self.original_height == 0 {
            return Err(TaskError::InvalidDimensions {
                width: self.original_width,
                height: self.original_height,
            });
        }
        if !catalog.is_catalog_width(self.target_size) {
            return Err(TaskError::NotCatalogWidth(self.target_size));
        }
        if self.target_size > self.original_width {
            return Err(TaskError::Upscale {
                target: self.target_size,
                original: self.original_width,
            });
        }
        Ok(())
    }

    pub fn spec(&self, catalog: &VariantCatalog) -> VariantSpec {
        catalog.variant_spec(self.target_size, self.original_width, self.original_height)
    }

    /// Kafka key; tasks for one source share a partition
    pub fn message_key(&self) -> String {
        format!("{}/{}", self.source_bucket, self.source_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(target_size: u32) -> ProcessingTask {
        ProcessingTask {
            source_bucket: "originals".to_string(),
            source_key: "uploads/name.jpg".to_string(),
            target_size,
            original_width: 1200,
            original_height: 800,
        }
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(task(640)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "sourceBucket": "originals",
                "sourceKey": "uploads/name.jpg",
                "targetSize": 640,
                "originalWidth": 1200,
                "originalHeight": 800
            })
        );
    }

    #[test]
    fn test_all_fields_required() {
        let missing = serde_json::json!({
            "sourceBucket": "originals",
            "sourceKey": "uploads/name.jpg",
            "targetSize": 640,
            "originalWidth": 1200
        });
        assert!(serde_json::from_value::<ProcessingTask>(missing).is_err());
    }

    #[test]
    fn test_validate() {
        let catalog = VariantCatalog::default();
        assert_eq!(task(640).validate(&catalog), Ok(()));
        assert_eq!(task(641).validate(&catalog), Err(TaskError::NotCatalogWidth(641)));
        assert_eq!(
            task(1920).validate(&catalog),
            Err(TaskError::Upscale {
                target: 1920,
                original: 1200
            })
        );

        let mut no_key = task(640);
        no_key.source_key.clear();
        assert_eq!(no_key.validate(&catalog), Err(TaskError::MissingField("sourceKey")));

        let mut flat = task(640);
        flat.original_height = 0;
        assert!(matches!(
            flat.validate(&catalog),
            Err(TaskError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_spec_from_task_alone() {
        let spec = task(640).spec(&VariantCatalog::default());
        assert_eq!(spec.width, 640);
        assert_eq!(spec.height, 427);
        assert_eq!(spec.quality.quality, 85);
        assert_eq!(spec.formats.len(), 2);
    }
}
