use crate::{config::KafkaConfig, Error, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, trace};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A destination for keyed payloads. One `send` is one delivery attempt; the
/// call resolves only once the broker acknowledged or refused the write.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, key: &str, payload: &[u8]) -> Result<()>;
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
    queue_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        // Idempotence requires acks=all; librdkafka refuses the combination otherwise.
        let idempotent = matches!(config.acks.as_str(), "all" | "-1");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", env!("CARGO_PKG_NAME"))
            .set("acks", &config.acks)
            .set("enable.idempotence", idempotent.to_string())
            .set("compression.type", &config.compression)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("partitioner", &config.partitioner)
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            queue_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fetches topic metadata to prove the brokers are reachable and the
    /// topic exists. Topics are never created here.
    pub async fn verify(&self) -> Result<()> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();

        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| Error::BrokerUnavailable {
            message: format!("metadata task failed: {}", e),
        })??;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.topic)
            .ok_or_else(|| Error::Config(format!("Topic '{}' not found", self.topic)))?;

        if let Some(err) = topic.error() {
            return Err(Error::Config(format!(
                "Topic '{}' is not usable: {:?}",
                self.topic,
                RDKafkaErrorCode::from(err)
            )));
        }

        info!(
            topic = %self.topic,
            partitions = topic.partitions().len(),
            brokers = metadata.brokers().len(),
            "Connected to Kafka"
        );
        Ok(())
    }

    /// Waits for queued messages to be delivered.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::BrokerUnavailable {
                message: format!("flush task failed: {}", e),
            })??;
        debug!("Kafka producer flushed");
        Ok(())
    }
}

#[async_trait]
impl MessageSink for KafkaProducer {
    async fn send(&self, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(&self.topic).payload(payload).key(key);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
            .map_err(|(e, _)| classify(e))?;

        trace!(key, partition, offset, "Message acknowledged by broker");
        Ok(())
    }
}

/// Splits producer errors into refusals and transport failures.
pub fn classify(err: KafkaError) -> Error {
    match err {
        KafkaError::MessageProduction(
            code @ (RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition),
        ) => Error::BrokerRejected {
            message: code.to_string(),
        },
        other => Error::BrokerUnavailable {
            message: other.to_string(),
        },
    }
}
