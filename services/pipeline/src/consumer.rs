//! Kafka consumer wrapper for the pixforge pipeline.
//!
//! Messages are handled one at a time. A message whose handler fails (or runs
//! past the handler timeout) is re-published to its own topic with an
//! incremented `delivery-attempt` header until it has been delivered
//! `max_receive_count` times; after that it is moved to the dead letter topic.
//! The consumed offset is committed only once one of those outcomes succeeded,
//! so a crash in between leads to another delivery rather than a lost message.
//! Failures of messages read from the dead letter topic itself are logged and
//! dropped; they are never re-published.

use crate::config::KafkaConfig;
use crate::dead_letter::DeadLetter;
use crate::producer::{
    MessageSink, OutgoingMessage, PipelineProducer, ProducerError, CORRELATION_ID_HEADER,
    DELIVERY_ATTEMPT_HEADER, MESSAGE_TYPE_HEADER,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Message processing error: {0}")]
    ProcessingError(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to redeliver or dead-letter message: {0}")]
    RedeliveryFailed(#[from] ProducerError),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Timestamp of the message
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Get the correlation ID header
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID_HEADER)
    }

    /// Get the message type header
    pub fn message_type(&self) -> Option<&str> {
        self.header(MESSAGE_TYPE_HEADER)
    }

    /// 1-based delivery attempt; messages without the header are on their first
    pub fn attempt(&self) -> u32 {
        self.header(DELIVERY_ATTEMPT_HEADER)
            .and_then(|v| v.parse().ok())
            .filter(|attempt| *attempt > 0)
            .unwrap_or(1)
    }

    /// Headers to carry over when the message is re-published
    fn forwarded_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<_> = self
            .metadata
            .headers
            .iter()
            .filter(|(k, _)| k.as_str() != DELIVERY_ATTEMPT_HEADER)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        headers
    }
}

/// What happened to a message after its handler returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded
    Handled,
    /// Handler failed, message re-published for the given attempt
    Redelivered { next_attempt: u32 },
    /// Handler failed on the last allowed attempt
    DeadLettered { attempts: u32 },
    /// Handler failed on a dead letter; logged and not re-published
    Dropped,
}

/// Decide what to do with a message that failed on `attempt`
pub fn failure_disposition(attempt: u32, max_receive_count: u32) -> Disposition {
    if attempt < max_receive_count {
        Disposition::Redelivered {
            next_attempt: attempt + 1,
        }
    } else {
        Disposition::DeadLettered { attempts: attempt }
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            attempt = message.attempt(),
            error = %error,
            "Message processing failed"
        );
    }
}

/// High-level Kafka consumer wrapper
pub struct PipelineConsumer {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    settler: Settler,
    shutdown_tx: broadcast::Sender<()>,
}

impl PipelineConsumer {
    /// Create a new consumer. The producer is used for redelivery and
    /// dead-lettering.
    pub fn new(
        config: KafkaConfig,
        producer: Arc<PipelineProducer>,
        handler_timeout: Duration,
    ) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let settler = Settler::new(producer, &config, handler_timeout);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            settler,
            shutdown_tx,
        })
    }

    /// Subscribe to the specified topics
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        info!(?topics, "Subscribing to topics");
        self.consumer
            .subscribe(topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Subscribe to object-created notifications
    pub fn subscribe_uploads(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.uploads.as_str()])
    }

    /// Subscribe to per-width processing tasks
    pub fn subscribe_tasks(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.tasks.as_str()])
    }

    /// Subscribe to the dead letter topic
    pub fn subscribe_dead_letters(&self) -> Result<(), ConsumerError> {
        self.subscribe(&[self.config.topics.dead_letter_queue.as_str()])
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Start consuming messages and process them with the given handler.
    ///
    /// Returns an error if a failed message could neither be redelivered nor
    /// dead-lettered; its offset is left uncommitted so the group resumes from
    /// it after a restart.
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler + ?Sized>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_receiver();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                message_result = stream.next() => {
                    match message_result {
                        Some(Ok(borrowed_message)) => {
                            let incoming = convert_message(&borrowed_message);

                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                attempt = incoming.attempt(),
                                "Received message"
                            );

                            let disposition = self.settler.dispatch(handler.as_ref(), incoming).await?;
                            debug!(?disposition, "Message settled");

                            if let Err(e) = self
                                .consumer
                                .commit_message(&borrowed_message, CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit offset");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                            metrics::counter!("pipeline.kafka.errors").increment(1);
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }
}

/// Runs the handler for one message and settles a failure by redelivery or
/// dead-lettering through a [`MessageSink`]
pub struct Settler {
    sink: Arc<dyn MessageSink>,
    dead_letter_topic: String,
    max_receive_count: u32,
    handler_timeout: Duration,
}

impl Settler {
    pub fn new(sink: Arc<dyn MessageSink>, config: &KafkaConfig, handler_timeout: Duration) -> Self {
        Self {
            sink,
            dead_letter_topic: config.topics.dead_letter_queue.clone(),
            max_receive_count: config.reliability.max_receive_count,
            handler_timeout,
        }
    }

    /// Run the handler for one message and settle its outcome
    pub async fn dispatch<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
        incoming: IncomingMessage,
    ) -> Result<Disposition, ConsumerError> {
        let attempt = incoming.attempt();

        let result = match tokio::time::timeout(self.handler_timeout, handler.handle(incoming.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(ConsumerError::Timeout(self.handler_timeout)),
        };

        let error = match result {
            Ok(()) => {
                metrics::counter!("pipeline.messages.processed").increment(1);
                return Ok(Disposition::Handled);
            }
            Err(e) => e,
        };

        handler.on_error(&incoming, &error).await;
        metrics::counter!("pipeline.messages.failed").increment(1);

        if incoming.metadata.topic == self.dead_letter_topic {
            error!(
                partition = incoming.metadata.partition,
                offset = incoming.metadata.offset,
                error = %error,
                "Dropping failed dead letter"
            );
            return Ok(Disposition::Dropped);
        }

        let disposition = failure_disposition(attempt, self.max_receive_count);
        match disposition {
            Disposition::Redelivered { next_attempt } => {
                let message = OutgoingMessage::redelivery(
                    incoming.metadata.topic.as_str(),
                    incoming.key_str(),
                    &incoming.payload,
                    &incoming.forwarded_headers(),
                    next_attempt,
                );
                self.sink.publish(message).await?;
                metrics::counter!("pipeline.messages.redelivered").increment(1);
            }
            Disposition::DeadLettered { attempts } => {
                let letter = DeadLetter::new(
                    incoming.metadata.topic.clone(),
                    incoming.key_str(),
                    &incoming.payload,
                    error.to_string(),
                    attempts,
                );
                warn!(
                    original_topic = %letter.original_topic,
                    attempts,
                    error = %letter.error,
                    "Moving message to dead letter topic"
                );
                let message = OutgoingMessage::dead_letter(self.dead_letter_topic.as_str(), &letter)?;
                self.sink.publish(message).await?;
                metrics::counter!("pipeline.messages.dead_lettered").increment(1);
            }
            Disposition::Handled | Disposition::Dropped => {}
        }

        Ok(disposition)
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every published message; optionally rejects them
    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<OutgoingMessage>>,
        reject: bool,
    }

    impl RecordingSink {
        fn published(&self) -> Vec<OutgoingMessage> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl MessageSink for RecordingSink {
        async fn publish(&self, message: OutgoingMessage) -> Result<(), ProducerError> {
            if self.reject {
                return Err(ProducerError::SendError {
                    topic: message.topic,
                    message: "broker unavailable".to_string(),
                });
            }
            self.published.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: IncomingMessage) -> Result<(), ConsumerError> {
            Err(ConsumerError::ProcessingError("source not found".to_string()))
        }
    }

    struct SucceedingHandler;

    #[async_trait::async_trait]
    impl MessageHandler for SucceedingHandler {
        async fn handle(&self, _message: IncomingMessage) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _message: IncomingMessage) -> Result<(), ConsumerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn settler(sink: Arc<RecordingSink>) -> Settler {
        Settler::new(sink, &KafkaConfig::new("localhost:9092"), Duration::from_millis(50))
    }

    fn message_on(topic: &str, headers: &[(&str, &str)]) -> IncomingMessage {
        let mut message = message_with_headers(headers);
        message.metadata.topic = topic.to_string();
        message
    }

    fn header<'a>(message: &'a OutgoingMessage, key: &str) -> Option<&'a str> {
        message
            .headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn message_with_headers(headers: &[(&str, &str)]) -> IncomingMessage {
        IncomingMessage {
            payload: vec![1, 2, 3],
            metadata: MessageMetadata {
                topic: "pixforge.tasks".to_string(),
                partition: 0,
                offset: 100,
                key: Some(b"key".to_vec()),
                timestamp: Some(1234567890),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    #[test]
    fn test_incoming_message_headers() {
        let message = message_with_headers(&[
            ("correlation-id", "test-123"),
            ("message-type", "processing_task"),
        ]);

        assert_eq!(message.correlation_id(), Some("test-123"));
        assert_eq!(message.message_type(), Some("processing_task"));
        assert_eq!(message.key_str(), Some("key".to_string()));
    }

    #[test]
    fn test_attempt_defaults_to_first_delivery() {
        assert_eq!(message_with_headers(&[]).attempt(), 1);
        assert_eq!(message_with_headers(&[("delivery-attempt", "garbage")]).attempt(), 1);
        assert_eq!(message_with_headers(&[("delivery-attempt", "0")]).attempt(), 1);
        assert_eq!(message_with_headers(&[("delivery-attempt", "3")]).attempt(), 3);
    }

    #[test]
    fn test_forwarded_headers_drop_attempt() {
        let message = message_with_headers(&[
            ("delivery-attempt", "2"),
            ("message-type", "processing_task"),
        ]);

        let headers = message.forwarded_headers();
        assert_eq!(
            headers,
            vec![("message-type".to_string(), "processing_task".to_string())]
        );
    }

    #[test]
    fn test_failure_disposition_bounded_by_receive_count() {
        assert_eq!(
            failure_disposition(1, 3),
            Disposition::Redelivered { next_attempt: 2 }
        );
        assert_eq!(
            failure_disposition(2, 3),
            Disposition::Redelivered { next_attempt: 3 }
        );
        assert_eq!(
            failure_disposition(3, 3),
            Disposition::DeadLettered { attempts: 3 }
        );
        assert_eq!(
            failure_disposition(1, 1),
            Disposition::DeadLettered { attempts: 1 }
        );
    }

    #[tokio::test]
    async fn test_successful_message_publishes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let disposition = settler(sink.clone())
            .dispatch(&SucceedingHandler, message_on("pixforge.tasks", &[]))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Handled);
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn test_failed_message_is_redelivered_with_next_attempt() {
        let sink = Arc::new(RecordingSink::default());
        let disposition = settler(sink.clone())
            .dispatch(
                &FailingHandler,
                message_on(
                    "pixforge.tasks",
                    &[("delivery-attempt", "1"), ("message-type", "processing_task")],
                ),
            )
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Redelivered { next_attempt: 2 });
        let published = sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "pixforge.tasks");
        assert_eq!(published[0].key.as_deref(), Some("key"));
        assert_eq!(published[0].payload, vec![1, 2, 3]);
        assert_eq!(header(&published[0], DELIVERY_ATTEMPT_HEADER), Some("2"));
        assert_eq!(header(&published[0], MESSAGE_TYPE_HEADER), Some("processing_task"));
    }

    #[tokio::test]
    async fn test_last_attempt_is_dead_lettered_with_envelope() {
        let sink = Arc::new(RecordingSink::default());
        let disposition = settler(sink.clone())
            .dispatch(&FailingHandler, message_on("pixforge.tasks", &[("delivery-attempt", "3")]))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::DeadLettered { attempts: 3 });
        let published = sink.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "pixforge.dlq");
        assert_eq!(header(&published[0], "original-topic"), Some("pixforge.tasks"));

        let letter: DeadLetter = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(letter.original_topic, "pixforge.tasks");
        assert_eq!(letter.original_key.as_deref(), Some("key"));
        assert_eq!(letter.attempts, 3);
        assert!(letter.error.contains("source not found"));
        assert_eq!(letter.payload().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let sink = Arc::new(RecordingSink::default());
        let disposition = settler(sink.clone())
            .dispatch(&SlowHandler, message_on("pixforge.tasks", &[]))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Redelivered { next_attempt: 2 });
        assert_eq!(sink.published().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_is_dropped_not_republished() {
        let sink = Arc::new(RecordingSink::default());
        let settler = settler(sink.clone());

        for attempt in ["1", "3"] {
            let disposition = settler
                .dispatch(&FailingHandler, message_on("pixforge.dlq", &[("delivery-attempt", attempt)]))
                .await
                .unwrap();
            assert_eq!(disposition, Disposition::Dropped);
        }
        assert!(sink.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_stops_settlement() {
        let sink = Arc::new(RecordingSink {
            reject: true,
            ..Default::default()
        });
        let result = settler(sink)
            .dispatch(&FailingHandler, message_on("pixforge.tasks", &[]))
            .await;

        assert!(matches!(result, Err(ConsumerError::RedeliveryFailed(_))));
    }
}
