use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::event::DecoderConfig;
use crate::kafka::config::{producer_config, ConsumerConfigBuilder, TlsFiles};
use crate::pipeline::PipelineConfig;
use crate::reconcile::{CompositeIdRule, IdConversion, ReconcilerConfig};
use crate::retry::RetryPolicy;
use crate::sink::mongo::MongoSinkConfig;

const TOPIC_PREFIX: &str = "user-consumable-";
const BOOTSTRAP_SUFFIX: &str = "-bootstrap.streaming.ditto.live:443";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration. Hosts and group are derived from the topic when unset.
    pub kafka_hosts: Option<String>,

    pub kafka_consumer_group: Option<String>,

    #[envconfig(default = "")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "true")]
    pub kafka_tls: bool,

    #[envconfig(default = "cluster.cert")]
    pub kafka_ssl_ca_location: String,

    #[envconfig(default = "user.cert")]
    pub kafka_ssl_certificate_location: String,

    #[envconfig(default = "user.key")]
    pub kafka_ssl_key_location: String,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    // Pipeline loop configuration
    #[envconfig(default = "1000")]
    pub poll_timeout_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub commit_interval_ms: EnvMsDuration,

    #[envconfig(default = "false")]
    pub stop_at_partition_eof: bool,

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(default = "100")]
    pub partition_channel_size: usize,

    #[envconfig(default = "60000")]
    pub connection_loss_tolerance_ms: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    // Sink configuration
    #[envconfig(default = "")]
    pub sink_uri: String,

    #[envconfig(default = "matt-db")]
    pub sink_database: NonEmptyString,

    #[envconfig(default = "ditto")]
    pub sink_collection: NonEmptyString,

    #[envconfig(default = "5000")]
    pub sink_write_timeout_ms: EnvMsDuration,

    // Identifier reconciliation
    #[envconfig(default = "_id")]
    pub id_field: NonEmptyString,

    // Comma separated
    #[envconfig(default = "_version")]
    pub metadata_fields: String,

    #[envconfig(default = "auto")]
    pub id_conversion: IdConversion,

    #[envconfig(default = "reject")]
    pub composite_id_rule: String,

    #[envconfig(default = "::")]
    pub composite_id_separator: NonEmptyString,

    // Skipped events are published here when set
    pub dead_letter_topic: Option<String>,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Positional arguments win over the environment.
    pub fn with_overrides(mut self, sink_uri: Option<String>, topic: Option<String>) -> Self {
        if let Some(sink_uri) = sink_uri {
            self.sink_uri = sink_uri;
        }
        if let Some(topic) = topic {
            self.kafka_consumer_topic = topic;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sink_uri.is_empty() {
            return Err(ConfigError::Missing("SINK_URI"));
        }
        if self.kafka_consumer_topic.is_empty() {
            return Err(ConfigError::Missing("KAFKA_CONSUMER_TOPIC"));
        }
        if !matches!(
            self.kafka_consumer_offset_reset.as_str(),
            "earliest" | "latest"
        ) {
            return Err(ConfigError::Invalid {
                name: "KAFKA_CONSUMER_OFFSET_RESET",
                value: self.kafka_consumer_offset_reset.clone(),
            });
        }
        if self.partition_channel_size == 0 {
            return Err(ConfigError::Invalid {
                name: "PARTITION_CHANNEL_SIZE",
                value: "0".to_string(),
            });
        }
        self.composite_id_rule()?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bootstrap_servers(&self) -> String {
        self.kafka_hosts
            .clone()
            .unwrap_or_else(|| derive_bootstrap_servers(&self.kafka_consumer_topic))
    }

    pub fn consumer_group(&self) -> String {
        self.kafka_consumer_group
            .clone()
            .unwrap_or_else(|| self.kafka_consumer_topic.clone())
    }

    /// Certificate files, `None` when TLS is off or no CA is configured.
    pub fn tls_files(&self) -> Option<TlsFiles> {
        if !self.kafka_tls || self.kafka_ssl_ca_location.is_empty() {
            return None;
        }
        Some(TlsFiles {
            ca_location: self.kafka_ssl_ca_location.clone(),
            certificate_location: self.kafka_ssl_certificate_location.clone(),
            key_location: self.kafka_ssl_key_location.clone(),
        })
    }

    pub fn to_consumer_config(&self) -> ClientConfig {
        let mut builder =
            ConsumerConfigBuilder::new(&self.bootstrap_servers(), &self.consumer_group())
                .offset_reset(&self.kafka_consumer_offset_reset)
                .partition_eof(self.stop_at_partition_eof);
        if self.kafka_tls {
            builder = builder.with_tls(self.tls_files().as_ref());
        }
        builder.build()
    }

    pub fn to_producer_config(&self) -> ClientConfig {
        let mut config = producer_config(
            &self.bootstrap_servers(),
            self.tls_files().as_ref(),
            self.kafka_message_timeout_ms,
        );
        if self.kafka_tls {
            config.set("security.protocol", "ssl");
        }
        config
    }

    pub fn metadata_fields(&self) -> Vec<String> {
        self.metadata_fields
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn composite_id_rule(&self) -> Result<CompositeIdRule, ConfigError> {
        match self.composite_id_rule.as_str() {
            "reject" => Ok(CompositeIdRule::Reject),
            "concatenate" => Ok(CompositeIdRule::Concatenate {
                separator: self.composite_id_separator.as_str().to_string(),
            }),
            other => Err(ConfigError::Invalid {
                name: "COMPOSITE_ID_RULE",
                value: other.to_string(),
            }),
        }
    }

    pub fn to_decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            id_field: self.id_field.as_str().to_string(),
            metadata_fields: self.metadata_fields(),
        }
    }

    pub fn to_reconciler_config(&self) -> Result<ReconcilerConfig, ConfigError> {
        Ok(ReconcilerConfig {
            id_field: self.id_field.as_str().to_string(),
            id_conversion: self.id_conversion,
            composite_rule: self.composite_id_rule()?,
        })
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            topic: self.kafka_consumer_topic.clone(),
            poll_timeout: self.poll_timeout_ms.0,
            commit_interval: self.commit_interval_ms.0,
            stop_at_partition_eof: self.stop_at_partition_eof,
            shutdown_timeout: self.shutdown_timeout_ms.0,
            channel_buffer_size: self.partition_channel_size,
            connection_loss_tolerance: self.connection_loss_tolerance_ms.0,
        }
    }

    pub fn to_sink_config(&self) -> MongoSinkConfig {
        MongoSinkConfig {
            uri: self.sink_uri.clone(),
            database: self.sink_database.as_str().to_string(),
            collection: self.sink_collection.as_str().to_string(),
            timeout: self.sink_write_timeout_ms.0,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.sink_write_timeout_ms.0
    }
}

/// Streaming clusters are addressed by the topic name without its
/// consumable prefix.
pub fn derive_bootstrap_servers(topic: &str) -> String {
    let cluster = topic.strip_prefix(TOPIC_PREFIX).unwrap_or(topic);
    format!("{cluster}{BOOTSTRAP_SUFFIX}")
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "5")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.poll_timeout_ms.0, Duration::from_secs(1));
        assert_eq!(config.commit_interval_ms.0, Duration::from_secs(5));
        assert!(!config.stop_at_partition_eof);
        assert!(config.kafka_tls);
        assert_eq!(config.sink_database.as_str(), "matt-db");
        assert_eq!(config.sink_collection.as_str(), "ditto");
        assert_eq!(config.metadata_fields(), vec!["_version".to_string()]);
        assert_eq!(config.id_conversion, IdConversion::Auto);
        assert_eq!(config.composite_id_rule(), Ok(CompositeIdRule::Reject));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.dead_letter_topic, None);
    }

    #[test]
    fn test_positional_overrides_and_derived_kafka_settings() {
        let config = config_from(&[]).with_overrides(
            Some("mongodb://localhost:27017".to_string()),
            Some("user-consumable-acme".to_string()),
        );

        assert_eq!(config.validate(), Ok(()));
        assert_eq!(
            config.bootstrap_servers(),
            "acme-bootstrap.streaming.ditto.live:443"
        );
        assert_eq!(config.consumer_group(), "user-consumable-acme");

        let consumer = config.to_consumer_config();
        assert_eq!(consumer.get("group.id"), Some("user-consumable-acme"));
        assert_eq!(consumer.get("security.protocol"), Some("ssl"));
        assert_eq!(consumer.get("ssl.key.location"), Some("user.key"));
        assert_eq!(consumer.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_explicit_hosts_and_group_win() {
        let config = config_from(&[
            ("KAFKA_HOSTS", "localhost:9092"),
            ("KAFKA_CONSUMER_GROUP", "bridge"),
            ("KAFKA_CONSUMER_TOPIC", "changes"),
            ("KAFKA_TLS", "false"),
        ]);

        assert_eq!(config.bootstrap_servers(), "localhost:9092");
        assert_eq!(config.consumer_group(), "bridge");
        assert_eq!(config.tls_files(), None);
        assert_eq!(config.to_consumer_config().get("security.protocol"), None);
    }

    #[test]
    fn test_derive_bootstrap_servers_without_prefix() {
        assert_eq!(
            derive_bootstrap_servers("acme"),
            "acme-bootstrap.streaming.ditto.live:443"
        );
    }

    #[test]
    fn test_validate_requires_positionals() {
        let config = config_from(&[("KAFKA_CONSUMER_TOPIC", "changes")]);
        assert_eq!(config.validate(), Err(ConfigError::Missing("SINK_URI")));

        let config = config_from(&[("SINK_URI", "mongodb://localhost")]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Missing("KAFKA_CONSUMER_TOPIC"))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_composite_rule() {
        let config = config_from(&[
            ("SINK_URI", "mongodb://localhost"),
            ("KAFKA_CONSUMER_TOPIC", "changes"),
            ("COMPOSITE_ID_RULE", "hash"),
        ]);

        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid {
                name: "COMPOSITE_ID_RULE",
                value: "hash".to_string()
            })
        );
    }

    #[test]
    fn test_sub_configs() {
        let config = config_from(&[
            ("KAFKA_CONSUMER_TOPIC", "changes"),
            ("METADATA_FIELDS", "_version, _rev,"),
            ("ID_CONVERSION", "object_id"),
            ("COMPOSITE_ID_RULE", "concatenate"),
            ("COMPOSITE_ID_SEPARATOR", "|"),
            ("MAX_ATTEMPTS", "3"),
            ("INITIAL_INTERVAL", "50"),
            ("STOP_AT_PARTITION_EOF", "true"),
        ]);

        let decoder = config.to_decoder_config();
        assert_eq!(decoder.metadata_fields, vec!["_version", "_rev"]);

        let reconciler = config.to_reconciler_config().unwrap();
        assert_eq!(reconciler.id_conversion, IdConversion::ObjectId);
        assert_eq!(
            reconciler.composite_rule,
            CompositeIdRule::Concatenate {
                separator: "|".to_string()
            }
        );

        let policy = config.retry_policy.provide();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_interval(1), Duration::from_millis(50));

        let pipeline = config.to_pipeline_config();
        assert_eq!(pipeline.topic, "changes");
        assert!(pipeline.stop_at_partition_eof);
        assert_eq!(
            config.to_consumer_config().get("enable.partition.eof"),
            Some("true")
        );
    }
}
