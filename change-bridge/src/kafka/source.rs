use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::error::{FatalError, SourceError};
use crate::kafka::types::{Partition, SourceMessage};

/// A subscribable, partitioned, offset-addressed log of change events.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), SourceError>;

    /// Wait at most `timeout` for the next message. `Ok(None)` means nothing
    /// arrived in time, which is not an error.
    async fn poll(&self, timeout: Duration) -> Result<Option<SourceMessage>, SourceError>;

    /// Durably record that every event up to and including `applied_offset`
    /// on `partition` has been processed.
    async fn commit(
        &self,
        partition: &Partition,
        applied_offset: i64,
        mode: CommitMode,
    ) -> Result<(), SourceError>;

    /// Partitions currently assigned to this consumer.
    fn assignment(&self) -> Result<Vec<Partition>, SourceError>;

    async fn close(&self);
}

/// Change source backed by a Kafka consumer group.
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: OnceLock<String>,
}

impl KafkaSource {
    pub fn new(config: &ClientConfig) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = config.create()?;

        Ok(Self {
            consumer,
            topic: OnceLock::new(),
        })
    }

    /// "Ping" the brokers by requesting cluster metadata.
    pub fn check_connection(&self, timeout: Duration) -> Result<(), KafkaError> {
        let metadata = self.consumer.fetch_metadata(None, timeout)?;
        info!(
            brokers = metadata.brokers().len(),
            topics = metadata.topics().len(),
            "Connected to Kafka brokers"
        );
        Ok(())
    }

    fn topic(&self) -> &str {
        self.topic.get().map(String::as_str).unwrap_or_default()
    }
}

#[async_trait]
impl ChangeSource for KafkaSource {
    async fn subscribe(&self, topic: &str) -> Result<(), SourceError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| classify_kafka_error(e, topic))?;
        if let Err(ignored) = self.topic.set(topic.to_string()) {
            // A source serves one topic, a second subscribe keeps the first name.
            debug!(topic = %ignored, "Source already subscribed, keeping the first topic");
        }
        info!(topic = topic, "Subscribed to the change topic");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<SourceMessage>, SourceError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => {
                let partition = Partition::new(message.topic().to_string(), message.partition());
                Ok(Some(SourceMessage::new(
                    partition,
                    message.offset(),
                    message.payload().map(<[u8]>::to_vec),
                )))
            }
            Ok(Err(e)) => Err(classify_kafka_error(e, self.topic())),
        }
    }

    async fn commit(
        &self,
        partition: &Partition,
        applied_offset: i64,
        mode: CommitMode,
    ) -> Result<(), SourceError> {
        // Kafka commits the position of the next message to read.
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(applied_offset + 1),
        )
        .map_err(|e| classify_kafka_error(e, partition.topic()))?;

        self.consumer
            .commit(&list, mode)
            .map_err(|e| classify_kafka_error(e, partition.topic()))
    }

    fn assignment(&self) -> Result<Vec<Partition>, SourceError> {
        let assigned = self
            .consumer
            .assignment()
            .map_err(|e| classify_kafka_error(e, self.topic()))?;

        Ok(assigned.elements().into_iter().map(Partition::from).collect())
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        info!(topic = self.topic(), "Unsubscribed from the change topic");
    }
}

/// Sort consumer errors into the source error taxonomy.
pub fn classify_kafka_error(err: KafkaError, topic: &str) -> SourceError {
    if let KafkaError::PartitionEOF(partition) = err {
        return SourceError::EndOfPartition(Partition::new(topic.to_string(), partition));
    }

    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => SourceError::Fatal(FatalError::AuthFailure {
            component: "kafka",
            message: err.to_string(),
        }),
        Some(RDKafkaErrorCode::AllBrokersDown) => SourceError::ConnectionLost(err.to_string()),
        _ => SourceError::Transient(err.to_string()),
    }
}
