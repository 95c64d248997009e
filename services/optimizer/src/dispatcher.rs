//! Fan-out stage: one object-created event in, one task per applicable width out.

use crate::catalog::VariantCatalog;
use crate::error::DispatchError;
use crate::event::ObjectCreated;
use crate::queue::TaskQueue;
use crate::render::VariantRenderer;
use crate::store::ObjectStore;
use crate::task::ProcessingTask;
use crate::variant::SourceImage;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A width whose task could not be enqueued
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueFailure {
    pub width: u32,
    pub error: String,
}

/// Per-width outcome of one fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub source: SourceImage,
    /// Applicable widths, ascending
    pub sizes: Vec<u32>,
    pub enqueued: Vec<u32>,
    pub failed: Vec<EnqueueFailure>,
}

impl DispatchReport {
    pub fn failed_widths(&self) -> Vec<u32> {
        self.failed.iter().map(|f| f.width).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reads a new source once, selects its widths and enqueues the tasks
pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn TaskQueue>,
    renderer: VariantRenderer,
    catalog: Arc<VariantCatalog>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn TaskQueue>,
        renderer: VariantRenderer,
        catalog: Arc<VariantCatalog>,
    ) -> Self {
        Self {
            store,
            queue,
            renderer,
            catalog,
        }
    }

    /// Fetch the source, read its dimensions and enqueue every applicable
    /// width.
    ///
    /// An unreadable source fails the event. Every send is attempted even if
    /// others fail; any failed send yields [`DispatchError::PartialFanOut`]
    /// so the event is delivered again.
    #[instrument(skip(self, event), fields(bucket = %event.bucket, source_key = %event.key))]
    pub async fn dispatch(&self, event: &ObjectCreated) -> Result<DispatchReport, DispatchError> {
        let data = self.store.get(&event.bucket, &event.key).await?;
        let dimensions = self.renderer.probe(data).await?;

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
                "Source narrower than every catalog width, nothing to dispatch"
            );
            return Ok(DispatchReport {
                source,
                sizes,
                enqueued: Vec::new(),
                failed: Vec::new(),
            });
        }

        let sends = sizes.iter().map(|width| {
            let task = ProcessingTask::new(&source, *width);
            async move {
                let result = self.queue.send(&task).await;
                (task.target_size, result)
            }
        });

        let mut enqueued = Vec::with_capacity(sizes.len());
        let mut failed = Vec::new();
        for (width, result) in join_all(sends).await {
            match result {
                Ok(()) => enqueued.push(width),
                Err(e) => {
                    warn!(width, error = %e, "Failed to enqueue processing task");
                    failed.push(EnqueueFailure {
                        width,
                        error: e.to_string(),
                    });
                }
            }
        }

        metrics::counter!("optimizer.tasks.enqueued").increment(enqueued.len() as u64);
        metrics::counter!("optimizer.tasks.enqueue_failed").increment(failed.len() as u64);

        let report = DispatchReport {
            source,
            sizes,
            enqueued,
            failed,
        };

        if !report.is_complete() {
            return Err(DispatchError::PartialFanOut(Box::new(report)));
        }

        info!(
            width = report.source.width,
            height = report.source.height,
            tasks = report.enqueued.len(),
            "Processing tasks dispatched"
        );
        Ok(report)
    }
}
