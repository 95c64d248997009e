//! Kafka producer wrapper for the pixforge pipeline.
//!
//! This module provides a high-level interface for producing JSON messages to
//! Kafka topics, plus the message shapes used to re-publish failed messages
//! for another delivery attempt and to move exhausted ones to the dead letter
//! topic.

use crate::config::KafkaConfig;
use crate::dead_letter::DeadLetter;
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the 1-based delivery attempt of a message
pub const DELIVERY_ATTEMPT_HEADER: &str = "delivery-attempt";
/// Header describing the payload type
pub const MESSAGE_TYPE_HEADER: &str = "message-type";
/// Header carrying a correlation ID across stages
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if provided)
    pub key: Option<String>,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a correlation ID header
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header(CORRELATION_ID_HEADER, id)
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header(MESSAGE_TYPE_HEADER, msg_type)
    }

    /// Set the delivery attempt header, replacing any previous value
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.headers.retain(|(k, _)| k != DELIVERY_ATTEMPT_HEADER);
        self.with_header(DELIVERY_ATTEMPT_HEADER, attempt.to_string())
    }

    /// Copy of a failed message for another delivery attempt on its own topic
    pub fn redelivery(
        topic: impl Into<String>,
        key: Option<String>,
        payload: &[u8],
        headers: &[(String, String)],
        next_attempt: u32,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: key.or_else(|| Some(Uuid::new_v4().to_string())),
            payload: payload.to_vec(),
            headers: headers.to_vec(),
        }
        .with_attempt(next_attempt)
    }

    /// Envelope publication of an exhausted message on the dead letter topic
    pub fn dead_letter(topic: impl Into<String>, letter: &DeadLetter) -> Result<Self, ProducerError> {
        Ok(Self::new_json(topic, letter)?
            .with_key(
                letter
                    .original_key
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            )
            .with_message_type("dead_letter")
            .with_header("original-topic", letter.original_topic.as_str())
            .with_header("error-reason", letter.error.as_str()))
    }

    fn owned_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            })
    }
}

/// Destination for messages the consumer re-publishes when settling failures
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError>;
}

/// High-level Kafka producer wrapper
pub struct PipelineProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    default_timeout: Duration,
}

impl PipelineProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            brokers = %config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config: Arc::new(config),
            default_timeout,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let timeout = self.default_timeout;
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(message.owned_headers());

        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl MessageSink for PipelineProducer {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
        self.send(message).await.map(|_| ())
    }
}

impl Drop for PipelineProducer {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}
