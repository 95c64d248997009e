//! Variant worker: one processing task in, one width's variants stored.

use crate::catalog::VariantCatalog;
use crate::error::WorkerError;
use crate::render::{VariantRenderer, VariantWriter};
use crate::store::ObjectStore;
use crate::task::ProcessingTask;
use crate::variant::VariantObject;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct VariantWorker {
    store: Arc<dyn ObjectStore>,
    renderer: VariantRenderer,
    writer: VariantWriter,
    catalog: Arc<VariantCatalog>,
}

impl VariantWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        renderer: VariantRenderer,
        writer: VariantWriter,
        catalog: Arc<VariantCatalog>,
    ) -> Self {
        Self {
            store,
            renderer,
            writer,
            catalog,
        }
    }

    /// Render and store every format for the task's width.
    ///
    /// The source is fetched again here rather than handed over by the
    /// dispatcher. Any failure fails the whole task; variants already written
    /// are simply overwritten on the next attempt.
    #[instrument(
        skip(self, task),
        fields(source_key = %task.source_key, width = task.target_size)
    )]
    pub async fn process(&self, task: &ProcessingTask) -> Result<Vec<VariantObject>, WorkerError> {
        task.validate(&self.catalog)?;
        let spec = task.spec(&self.catalog);

        let data = self.store.get(&task.source_bucket, &task.source_key).await?;
        let image = self.renderer.decode(data).await?;

        if image.width() != task.original_width || image.height() != task.original_height {
            // task dimensions stay authoritative
            warn!(
                task_width = task.original_width,
                task_height = task.original_height,
                actual_width = image.width(),
                actual_height = image.height(),
                "Source dimensions differ from task"
            );
        }

        let variants = self.renderer.render(&task.source_key, image, &spec).await?;
        self.writer.write_all(&variants).await?;

        info!(
            height = spec.height,
            formats = variants.len(),
            bytes = variants.iter().map(|v| v.size_bytes()).sum::<usize>(),
            "Variants stored"
        );
        Ok(variants)
    }
}
