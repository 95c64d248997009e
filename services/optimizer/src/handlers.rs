//! Kafka message handlers for each stage.
//!
//! A handler error hands the message back to the pipeline consumer, which
//! redelivers it until the receive count is exhausted and then dead-letters it.

use crate::dispatcher::Dispatcher;
use crate::event::{parse_notification, ObjectCreated};
use crate::processor::SingleStageProcessor;
use crate::task::ProcessingTask;
use crate::worker::VariantWorker;
use async_trait::async_trait;
use pixforge_pipeline::{ConsumerError, IncomingMessage, MessageHandler};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

/// Run `handle` for every object-created record that is not itself a variant.
/// All records are attempted; the message fails if any of them failed.
async fn for_each_upload<F, Fut, E>(message: &IncomingMessage, handle: F) -> Result<usize, ConsumerError>
where
    F: Fn(ObjectCreated) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let events = parse_notification(&message.payload)
        .map_err(|e| ConsumerError::DeserializationError(e.to_string()))?;

    let mut handled = 0;
    let mut failures = Vec::new();

    for event in events {
        if event.is_derived() {
            debug!(key = %event.key, "Ignoring notification for derived variant");
            continue;
        }

        let key = event.key.clone();
        match handle(event).await {
            Ok(()) => handled += 1,
            Err(e) => {
                error!(source_key = %key, error = %e, "Failed to process upload");
                failures.push(format!("{}: {}", key, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(handled)
    } else {
        Err(ConsumerError::ProcessingError(failures.join("; ")))
    }
}

/// Consumes object-created notifications and fans out processing tasks
pub struct DispatchHandler {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        for_each_upload(&message, |event| async move {
            self.dispatcher.dispatch(&event).await.map(|_| ())
        })
        .await?;
        Ok(())
    }
}

/// Consumes processing tasks and stores the variants for one width
pub struct WorkerHandler {
    worker: Arc<VariantWorker>,
}

impl WorkerHandler {
    pub fn new(worker: Arc<VariantWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl MessageHandler for WorkerHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let task: ProcessingTask = message.decode_json()?;

        self.worker
            .process(&task)
            .await
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;

        Ok(())
    }
}

/// Consumes object-created notifications and stores every variant in one go
pub struct ProcessorHandler {
    processor: Arc<SingleStageProcessor>,
}

impl ProcessorHandler {
    pub fn new(processor: Arc<SingleStageProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl MessageHandler for ProcessorHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        for_each_upload(&message, |event| async move {
            self.processor.process(&event).await.map(|_| ())
        })
        .await?;
        Ok(())
    }
}
