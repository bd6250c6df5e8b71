use rdkafka::ClientConfig;

/// Certificate material for a mutually authenticated SSL connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca_location: String,
    pub certificate_location: String,
    pub key_location: String,
}

/// Kafka consumer configuration builder for the change feed.
///
/// Offsets are only ever committed explicitly by the pipeline, so auto commit
/// and auto offset store are both disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Connect over SSL, authenticating with client certificates when given.
    pub fn with_tls(mut self, files: Option<&TlsFiles>) -> Self {
        self.config.set("security.protocol", "ssl");
        if let Some(files) = files {
            self.config
                .set("ssl.ca.location", &files.ca_location)
                .set("ssl.certificate.location", &files.certificate_location)
                .set("ssl.key.location", &files.key_location);
        }
        self
    }

    /// Where to start when the group has no committed offset: earliest or latest
    pub fn offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Emit an end-of-partition event when the consumer catches up, used by
    /// bounded runs to know when to stop.
    pub fn partition_eof(mut self, enabled: bool) -> Self {
        self.config.set("enable.partition.eof", enabled.to_string());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Producer configuration for the dead letter topic.
pub fn producer_config(
    bootstrap_servers: &str,
    tls: Option<&TlsFiles>,
    message_timeout_ms: u32,
) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bootstrap_servers)
        .set("message.timeout.ms", message_timeout_ms.to_string())
        .set("compression.codec", "none");

    if let Some(files) = tls {
        config
            .set("security.protocol", "ssl")
            .set("ssl.ca.location", &files.ca_location)
            .set("ssl.certificate.location", &files.certificate_location)
            .set("ssl.key.location", &files.key_location);
    }
    config
}
