use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::error;

use crate::diagnostics::{log_skip, SkipReport, SkipReporter};
use crate::metrics_consts::DEAD_LETTER_FAILURES_COUNTER;

/// Publishes skip reports as JSON to a dead letter topic, keyed by
/// `topic:partition:offset` so replays land in source order.
///
/// Every report is also logged. A failed publish is logged and counted but
/// does not hold up the partition.
pub struct KafkaDeadLetterReporter {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaDeadLetterReporter {
    pub fn new(
        config: &ClientConfig,
        topic: String,
        send_timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let producer: FutureProducer = config.create()?;

        Ok(Self {
            producer,
            topic,
            send_timeout,
        })
    }
}

#[async_trait]
impl SkipReporter for KafkaDeadLetterReporter {
    async fn report(&self, report: SkipReport) {
        log_skip(&report);

        let payload = match serde_json::to_string(&report) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = ?e, "Failed to serialize skip report");
                metrics::counter!(DEAD_LETTER_FAILURES_COUNTER, "cause" => "serialization")
                    .increment(1);
                return;
            }
        };
        let key = format!("{}:{}:{}", report.topic, report.partition, report.offset);

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        if let Err((e, _)) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            error!(
                dead_letter_topic = %self.topic,
                topic = %report.topic,
                partition = report.partition,
                offset = report.offset,
                error = ?e,
                "Failed to publish skip report to dead letter topic"
            );
            metrics::counter!(DEAD_LETTER_FAILURES_COUNTER, "cause" => "produce").increment(1);
        }
    }
}
