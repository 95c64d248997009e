//! Pixforge Pipeline - Kafka task queue plumbing for image variant processing
//!
//! This library provides the queue layer shared by every stage of the image
//! optimization pipeline:
//!
//! - Object-created notifications consumed by the dispatcher
//! - Per-width processing tasks fanned out to variant workers
//! - Bounded redelivery and a dead letter topic for exhausted messages
//!
//! # Example
//!
//! ```rust,no_run
//! use pixforge_pipeline::{KafkaConfig, PipelineConsumer, PipelineProducer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = Arc::new(PipelineProducer::new(config.clone())?);
//!
//!     let consumer = PipelineConsumer::new(config, producer, Duration::from_secs(120))?;
//!     consumer.subscribe_tasks()?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod producer;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, ProducerConfig, ReliabilityConfig, SaslConfig,
    SaslMechanism, SecurityProtocol, SslConfig, TopicConfig,
};
pub use consumer::{
    async_trait, failure_disposition, ConsumerError, Disposition, IncomingMessage,
    MessageHandler, MessageMetadata, PipelineConsumer, Settler,
};
pub use dead_letter::DeadLetter;
pub use producer::{
    DeliveryResult, MessageSink, OutgoingMessage, PipelineProducer, ProducerError, CORRELATION_ID_HEADER,
    DELIVERY_ATTEMPT_HEADER, MESSAGE_TYPE_HEADER,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{
        async_trait, ConsumerError, IncomingMessage, MessageHandler, PipelineConsumer,
    };
    pub use crate::dead_letter::DeadLetter;
    pub use crate::producer::{OutgoingMessage, PipelineProducer, ProducerError};
}
