//! Single-stage topology: every width and format of a source in one invocation.
//!
//! Widths are processed in chunks of `chunk_size`; the widths of one chunk
//! (and the formats of each width) run concurrently, and a chunk must finish
//! before the next one starts. Peak memory therefore stays at roughly
//! `chunk_size` resized buffers plus the decoded source.

use crate::catalog::VariantCatalog;
use crate::error::WorkerError;
use crate::event::ObjectCreated;
use crate::render::{VariantRenderer, VariantWriter};
use crate::store::ObjectStore;
use crate::variant::{OutputFormat, SourceImage};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A stored variant, as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredVariant {
    pub key: String,
    pub width: u32,
    pub format: OutputFormat,
    pub size_bytes: usize,
}

/// Everything one single-stage invocation produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub source: SourceImage,
    pub sizes: Vec<u32>,
    pub variants: Vec<StoredVariant>,
}

pub struct SingleStageProcessor {
    store: Arc<dyn ObjectStore>,
    renderer: VariantRenderer,
    writer: VariantWriter,
    catalog: Arc<VariantCatalog>,
    chunk_size: usize,
}

impl SingleStageProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        renderer: VariantRenderer,
        writer: VariantWriter,
        catalog: Arc<VariantCatalog>,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            renderer,
            writer,
            catalog,
            chunk_size: chunk_size.max(1),
        }
    }

    #[instrument(skip(self, event), fields(bucket = %event.bucket, source_key = %event.key))]
    pub async fn process(&self, event: &ObjectCreated) -> Result<ProcessReport, WorkerError> {
        let data = self.store.get(&event.bucket, &event.key).await?;
        let dimensions = self.renderer.probe(data.clone()).await?;

        let source = SourceImage {
            bucket: event.bucket.clone(),
            key: event.key.clone(),
            width: dimensions.width,
            height: dimensions.height,
        };
        let sizes = self.catalog.applicable_sizes(source.width);

        if sizes.is_empty() {
            info!(
                width = source.width,
                height = source.height,
                "Source narrower than every catalog width, no variants produced"
            );
            return Ok(ProcessReport {
                source,
                sizes,
                variants: Vec::new(),
            });
        }

        let image = self.renderer.decode(data).await?;
        let mut variants = Vec::new();

        for chunk in sizes.chunks(self.chunk_size) {
            let jobs = chunk.iter().map(|width| {
                let spec = self
                    .catalog
                    .variant_spec(*width, source.width, source.height);
                let image = image.clone();
                let source_key = source.key.as_str();

                async move {
                    let rendered = self.renderer.render(source_key, image, &spec).await?;
                    self.writer.write_all(&rendered).await?;
                    Ok::<_, WorkerError>(rendered)
                }
            });

            for rendered in try_join_all(jobs).await? {
                variants.extend(rendered.into_iter().map(|v| StoredVariant {
                    size_bytes: v.size_bytes(),
                    key: v.key,
                    width: v.width,
                    format: v.format,
                }));
            }
            debug!(widths = ?chunk, "Chunk stored");
        }

        info!(
            widths = sizes.len(),
            variants = variants.len(),
            "All variants stored"
        );
        Ok(ProcessReport {
            source,
            sizes,
            variants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fake::{source_bytes, FakeCodec};
    use crate::error::CodecError;
    use crate::store::memory::MemoryObjectStore;

    fn processor(store: Arc<MemoryObjectStore>, codec: FakeCodec, chunk_size: usize) -> SingleStageProcessor {
        SingleStageProcessor::new(
            store.clone(),
            VariantRenderer::new(Arc::new(codec)),
            VariantWriter::new(store, "processed", "public, max-age=31536000, immutable", "v1"),
            Arc::new(VariantCatalog::default()),
            chunk_size,
        )
    }

    #[tokio::test]
    async fn test_produces_full_variant_set() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("originals", "uploads/name.jpg", source_bytes(1200, 800));

        let report = processor(store.clone(), FakeCodec::default(), 2)
            .process(&ObjectCreated::new("originals", "uploads/name.jpg"))
            .await
            .unwrap();

        let webp = report.variants.iter().filter(|v| v.format == OutputFormat::Webp).count();
        let mut avif: Vec<u32> = report
            .variants
            .iter()
            .filter(|v| v.format == OutputFormat::Avif)
            .map(|v| v.width)
            .collect();
        avif.sort_unstable();

        assert_eq!(webp, 11);
        assert_eq!(avif, vec![640, 828, 1200]);
        assert_eq!(store.keys("processed").len(), 14);
        assert!(store.object("processed", "processed/w1200/name.avif").is_some());
        // one fetch for the whole invocation
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_chunk_size_does_not_change_output() {
        let one = Arc::new(MemoryObjectStore::new());
        one.insert("originals", "a.png", source_bytes(700, 700));
        let five = Arc::new(MemoryObjectStore::new());
        five.insert("originals", "a.png", source_bytes(700, 700));

        processor(one.clone(), FakeCodec::default(), 1)
            .process(&ObjectCreated::new("originals", "a.png"))
            .await
            .unwrap();
        processor(five.clone(), FakeCodec::default(), 5)
            .process(&ObjectCreated::new("originals", "a.png"))
            .await
            .unwrap();

        assert_eq!(one.keys("processed"), five.keys("processed"));
        for key in one.keys("processed") {
            assert_eq!(one.object("processed", &key), five.object("processed", &key));
        }
    }

    #[tokio::test]
    async fn test_small_source_succeeds_with_no_variants() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("originals", "dot.png", source_bytes(10, 10));

        let report = processor(store.clone(), FakeCodec::default(), 2)
            .process(&ObjectCreated::new("originals", "dot.png"))
            .await
            .unwrap();

        assert!(report.sizes.is_empty());
        assert!(report.variants.is_empty());
        assert!(store.keys("processed").is_empty());
    }

    #[tokio::test]
    async fn test_any_failure_fails_invocation() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("originals", "a.png", source_bytes(900, 600));

        let result = processor(store, FakeCodec::failing(OutputFormat::Avif), 2)
            .process(&ObjectCreated::new("originals", "a.png"))
            .await;

        assert!(matches!(result, Err(WorkerError::Codec(CodecError::Encode { .. }))));
    }
}
