//! Rendering and storing variants.
//!
//! Shared by the variant worker and the single-stage processor. Codec work is
//! moved onto the blocking pool; the formats of one width are encoded
//! concurrently from the same resized buffer.

use crate::codec::ImageCodec;
use crate::error::{StoreError, WorkerError};
use crate::store::{ObjectStore, PutObject};
use crate::variant::{variant_key, Dimensions, VariantObject, VariantSpec};
use bytes::Bytes;
use futures::future::try_join_all;
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Decodes, resizes and encodes through an [`ImageCodec`]
#[derive(Clone)]
pub struct VariantRenderer {
    codec: Arc<dyn ImageCodec>,
}

impl VariantRenderer {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self { codec }
    }

    /// Read source dimensions on the blocking pool
    pub async fn probe(&self, data: Bytes) -> Result<Dimensions, WorkerError> {
        let codec = self.codec.clone();
        Ok(tokio::task::spawn_blocking(move || codec.probe(&data)).await??)
    }

    /// Decode a source image on the blocking pool
    pub async fn decode(&self, data: Bytes) -> Result<Arc<DynamicImage>, WorkerError> {
        let codec = self.codec.clone();
        let image = tokio::task::spawn_blocking(move || codec.decode(&data)).await??;
        Ok(Arc::new(image))
    }

    /// Render every format of `spec`. Fails as a whole if any format fails.
    #[instrument(skip(self, image, spec), fields(width = spec.width, height = spec.height))]
    pub async fn render(
        &self,
        source_key: &str,
        image: Arc<DynamicImage>,
        spec: &VariantSpec,
    ) -> Result<Vec<VariantObject>, WorkerError> {
        let started = Instant::now();
        let (width, height) = (spec.width, spec.height);

        let codec = self.codec.clone();
        let resized = tokio::task::spawn_blocking(move || codec.resize_contain(&image, width, height))
            .await??;
        let resized = Arc::new(resized);

        let encodes = spec.formats.iter().map(|format| {
            let format = *format;
            let codec = self.codec.clone();
            let resized = resized.clone();
            let quality = spec.quality;

            async move {
                let data =
                    tokio::task::spawn_blocking(move || codec.encode(&resized, format, &quality))
                        .await??;

                Ok::<_, WorkerError>(VariantObject {
                    key: variant_key(source_key, width, format),
                    format,
                    width,
                    height,
                    quality: quality.quality,
                    data: Bytes::from(data),
                })
            }
        });

        let variants = try_join_all(encodes).await?;

        metrics::histogram!("optimizer.render.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        debug!(
            formats = variants.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Variant rendered"
        );

        Ok(variants)
    }
}

/// Writes rendered variants to the processed bucket
#[derive(Clone)]
pub struct VariantWriter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    cache_control: String,
    encoder_profile: String,
}

impl VariantWriter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        cache_control: impl Into<String>,
        encoder_profile: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            cache_control: cache_control.into(),
            encoder_profile: encoder_profile.into(),
        }
    }

    pub fn put_request(&self, variant: &VariantObject) -> PutObject {
        PutObject {
            bucket: self.bucket.clone(),
            key: variant.key.clone(),
            body: variant.data.clone(),
            content_type: variant.format.content_type().to_string(),
            cache_control: self.cache_control.clone(),
            metadata: variant.metadata(&self.encoder_profile),
        }
    }

    pub async fn write(&self, variant: &VariantObject) -> Result<(), StoreError> {
        self.store.put(self.put_request(variant)).await?;

        metrics::counter!("optimizer.variants.stored", "format" => variant.format.extension())
            .increment(1);
        metrics::counter!("optimizer.bytes.stored").increment(variant.size_bytes() as u64);
        debug!(key = %variant.key, size_bytes = variant.size_bytes(), "Variant stored");
        Ok(())
    }

    /// Write all variants concurrently; any failure fails the batch
    pub async fn write_all(&self, variants: &[VariantObject]) -> Result<(), StoreError> {
        try_join_all(variants.iter().map(|variant| self.write(variant))).await?;
        Ok(())
    }
}
