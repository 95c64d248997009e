//! Task queue capability and its Kafka implementation.

use crate::error::QueueError;
use crate::task::ProcessingTask;
use async_trait::async_trait;
use pixforge_pipeline::{OutgoingMessage, PipelineProducer, ProducerError};
use std::sync::Arc;
use tracing::debug;

/// Message type header value for processing tasks
pub const PROCESSING_TASK_MESSAGE_TYPE: &str = "processing_task";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue one task; acknowledged independently of any other send
    async fn send(&self, task: &ProcessingTask) -> Result<(), QueueError>;
}

/// Publishes tasks to the Kafka tasks topic
pub struct KafkaTaskQueue {
    producer: Arc<PipelineProducer>,
    topic: String,
}

impl KafkaTaskQueue {
    pub fn new(producer: Arc<PipelineProducer>) -> Self {
        let topic = producer.config().topics.tasks.clone();
        Self { producer, topic }
    }
}

/// Build the Kafka message for a task
pub fn task_message(topic: &str, task: &ProcessingTask) -> Result<OutgoingMessage, QueueError> {
    Ok(OutgoingMessage::new_json(topic, task)
        .map_err(|e| QueueError::Serialize(e.to_string()))?
        .with_key(task.message_key())
        .with_message_type(PROCESSING_TASK_MESSAGE_TYPE)
        .with_correlation_id(task.source_key.clone())
        .with_attempt(1))
}

#[async_trait]
impl TaskQueue for KafkaTaskQueue {
    async fn send(&self, task: &ProcessingTask) -> Result<(), QueueError> {
        let message = task_message(&self.topic, task)?;

        let delivery = self.producer.send(message).await.map_err(|e| match e {
            ProducerError::SerializationError(msg) => QueueError::Serialize(msg),
            other => QueueError::Send(other.to_string()),
        })?;

        debug!(
            source_key = %task.source_key,
            width = task.target_size,
            partition = delivery.partition,
            offset = delivery.offset,
            "Task enqueued"
        );
        Ok(())
    }
}
