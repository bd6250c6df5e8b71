use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::applier::ChangeApplier;
use crate::config::Config;
use crate::diagnostics::{LogReporter, SkipReporter};
use crate::event::EventDecoder;
use crate::kafka::{KafkaDeadLetterReporter, KafkaSource};
use crate::pipeline::processor::EventProcessor;
use crate::pipeline::PipelineLoop;
use crate::reconcile::IdentifierReconciler;
use crate::server::Readiness;
use crate::sink::mongo::MongoSink;

const KAFKA_METADATA_TIMEOUT: Duration = Duration::from_secs(15);

/// Wires the sink, the source and the pipeline together from configuration.
pub struct ChangeBridgeService {
    config: Config,
    readiness: Readiness,
}

impl ChangeBridgeService {
    pub fn new(config: Config, readiness: Readiness) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for topic '{}'",
                config.kafka_consumer_topic
            )
        })?;

        Ok(Self { config, readiness })
    }

    /// Run until `shutdown` fires, a bounded run drains, or the pipeline
    /// fails. A failed pipeline is returned as an error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = &self.config;

        let sink = MongoSink::connect(&config.to_sink_config())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to sink database '{}'",
                    config.sink_database.as_str()
                )
            })?;
        sink.describe()
            .await
            .context("Sink did not answer the startup ping")?;

        let source = KafkaSource::new(&config.to_consumer_config()).with_context(|| {
            format!(
                "Failed to create Kafka consumer for topic '{}' with group '{}'",
                config.kafka_consumer_topic,
                config.consumer_group()
            )
        })?;
        source
            .check_connection(KAFKA_METADATA_TIMEOUT)
            .with_context(|| {
                format!(
                    "Failed to fetch metadata from Kafka brokers at '{}'",
                    config.bootstrap_servers()
                )
            })?;

        let reporter: Arc<dyn SkipReporter> = match &config.dead_letter_topic {
            Some(topic) => Arc::new(
                KafkaDeadLetterReporter::new(
                    &config.to_producer_config(),
                    topic.clone(),
                    Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
                )
                .with_context(|| format!("Failed to create dead letter producer for '{topic}'"))?,
            ),
            None => Arc::new(LogReporter),
        };

        let processor = EventProcessor::new(
            EventDecoder::new(config.to_decoder_config()),
            IdentifierReconciler::new(config.to_reconciler_config()?),
            ChangeApplier::new(Arc::new(sink), config.write_timeout()),
            config.retry_policy.provide(),
            reporter,
        );

        let mut pipeline = PipelineLoop::new(
            config.to_pipeline_config(),
            Arc::new(source),
            Arc::new(processor),
        );

        info!(
            topic = %config.kafka_consumer_topic,
            dead_letter_topic = ?config.dead_letter_topic,
            "Change bridge initialized"
        );
        self.readiness.mark_ready();
        let result = pipeline.run(shutdown).await;
        self.readiness.mark_unready();

        result.context("Change pipeline failed")
    }
}
