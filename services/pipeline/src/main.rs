//! Dead letter inspection tool
//!
//! Reads the dead letter topic and either logs every dead-lettered message
//! (`inspect`) or publishes the original payload back to the topic it came
//! from with a fresh delivery budget (`redrive`). Failures while handling a
//! letter are logged and the letter is skipped.

use anyhow::Result;
use pixforge_pipeline::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inspect,
    Redrive,
}

/// Logs or redrives dead-lettered messages
struct DeadLetterHandler {
    producer: Arc<PipelineProducer>,
    mode: Mode,
}

#[async_trait]
impl MessageHandler for DeadLetterHandler {
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        let letter: DeadLetter = message.decode_json()?;

        info!(
            offset = message.metadata.offset,
            original_topic = %letter.original_topic,
            original_key = ?letter.original_key,
            attempts = letter.attempts,
            error = %letter.error,
            dead_lettered_at = %letter.timestamp,
            "Dead letter"
        );

        if self.mode == Mode::Inspect {
            return Ok(());
        }

        let dead_letter_topic = &self.producer.config().topics.dead_letter_queue;
        let Some(outgoing) = redrive_message(&letter, dead_letter_topic, message.correlation_id())?
        else {
            warn!(
                offset = message.metadata.offset,
                original_topic = %letter.original_topic,
                "Refusing to redrive a letter back into the dead letter topic"
            );
            return Ok(());
        };

        self.producer
            .send(outgoing)
            .await
            .map_err(|e| ConsumerError::ProcessingError(e.to_string()))?;

        info!(original_topic = %letter.original_topic, "Message redriven");
        Ok(())
    }

    async fn on_error(&self, message: &IncomingMessage, error: &ConsumerError) {
        error!(
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Failed to handle dead letter"
        );
    }
}

/// Message that puts a letter's payload back on its original topic with a
/// fresh delivery budget. Letters that originate from the dead letter topic
/// itself are not redriven.
fn redrive_message(
    letter: &DeadLetter,
    dead_letter_topic: &str,
    correlation_id: Option<&str>,
) -> Result<Option<OutgoingMessage>, ConsumerError> {
    if letter.original_topic == dead_letter_topic {
        return Ok(None);
    }

    let payload = letter
        .payload()
        .map_err(|e| ConsumerError::DeserializationError(e.to_string()))?;

    let mut outgoing = OutgoingMessage {
        topic: letter.original_topic.clone(),
        key: letter.original_key.clone(),
        payload,
        headers: Vec::new(),
    }
    .with_message_type("redriven")
    .with_attempt(1);

    if let Some(correlation_id) = correlation_id {
        outgoing = outgoing.with_correlation_id(correlation_id);
    }

    Ok(Some(outgoing))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().collect();
    let mode = match args.get(1).map(|s| s.as_str()).unwrap_or("inspect") {
        "inspect" => Mode::Inspect,
        "redrive" => Mode::Redrive,
        _ => {
            println!("Usage: dlq-inspect [inspect|redrive]");
            println!();
            println!("Modes:");
            println!("  inspect - Log every dead-lettered message (default)");
            println!("  redrive - Publish dead-lettered payloads back to their original topic");
            println!();
            println!("Environment variables:");
            println!("  KAFKA_BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
            println!("  KAFKA_GROUP_ID          - Consumer group ID (default: pixforge)");
            println!("  KAFKA_DLQ_TOPIC         - Dead letter topic (default: pixforge.dlq)");
            println!("  KAFKA_SECURITY_PROTOCOL - Security protocol (plaintext, ssl, sasl_ssl)");
            println!("  KAFKA_SASL_USERNAME     - SASL username");
            println!("  KAFKA_SASL_PASSWORD     - SASL password");
            return Ok(());
        }
    };

    let mut config = KafkaConfig::from_env()?;
    if std::env::var("KAFKA_GROUP_ID").is_err() {
        config.consumer.group_id = format!("{}-dlq-{:?}", config.consumer.group_id, mode).to_lowercase();
    }
    info!(
        brokers = %config.bootstrap_servers,
        topic = %config.topics.dead_letter_queue,
        ?mode,
        "Starting dead letter tool"
    );

    let producer = Arc::new(PipelineProducer::new(config.clone())?);
    let consumer = Arc::new(PipelineConsumer::new(
        config,
        producer.clone(),
        Duration::from_secs(30),
    )?);
    consumer.subscribe_dead_letters()?;

    let shutdown_consumer = consumer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Received Ctrl+C, shutting down");
        shutdown_consumer.shutdown();
    });

    let handler = Arc::new(DeadLetterHandler { producer, mode });
    consumer.run(handler).await?;

    info!("Dead letter tool finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redrive_restores_original_topic_and_budget() {
        let letter = DeadLetter::new(
            "pixforge.tasks",
            Some("originals/cat.png".to_string()),
            br#"{"targetSize":640}"#,
            "timeout",
            3,
        );

        let outgoing = redrive_message(&letter, "pixforge.dlq", Some("corr-1"))
            .unwrap()
            .unwrap();

        assert_eq!(outgoing.topic, "pixforge.tasks");
        assert_eq!(outgoing.key.as_deref(), Some("originals/cat.png"));
        assert_eq!(outgoing.payload, br#"{"targetSize":640}"#.to_vec());
        assert!(outgoing
            .headers
            .contains(&("delivery-attempt".to_string(), "1".to_string())));
        assert!(outgoing
            .headers
            .contains(&("correlation-id".to_string(), "corr-1".to_string())));
    }

    #[test]
    fn test_letter_from_dead_letter_topic_is_not_redriven() {
        let letter = DeadLetter::new("pixforge.dlq", None, b"x", "not a dead letter", 3);
        assert!(redrive_message(&letter, "pixforge.dlq", None).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let mut letter = DeadLetter::new("pixforge.tasks", None, b"x", "boom", 3);
        letter.original_message_base64 = "!!not base64!!".to_string();
        assert!(matches!(
            redrive_message(&letter, "pixforge.dlq", None),
            Err(ConsumerError::DeserializationError(_))
        ));
    }
}
