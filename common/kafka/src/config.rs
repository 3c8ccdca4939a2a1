use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma separated bootstrap endpoints

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Stop retrying a message after 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "5000")]
    pub kafka_metadata_timeout_ms: u64, // Broker metadata probe used to check connectivity
}

impl KafkaConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }

    /// Producer client settings: fire-and-forget with delivery reports.
    pub fn producer_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", self.kafka_compression_codec.to_owned())
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka_producer_queue_mib * 1024).to_string(),
            );

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "bus-adapter")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "listen-topic")]
    pub kafka_consumer_topics: TopicList,

    // We default to "earliest" so a fresh group replays what it has not seen yet
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

/// Ordered, comma separated list of topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

impl TopicList {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("at least one topic is required")]
pub struct EmptyTopicListError;

impl FromStr for TopicList {
    type Err = EmptyTopicListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect();

        if topics.is_empty() {
            Err(EmptyTopicListError)
        } else {
            Ok(TopicList(topics))
        }
    }
}

/// Consumer-group client settings.
///
/// Offsets are stored explicitly by the adapter once a worker picks up a
/// record, and committed in the background by librdkafka.
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
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("socket.timeout.ms", "30000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000");

        Self { config }
    }

    pub fn from_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self::new(&kafka.kafka_hosts, &consumer.kafka_consumer_group)
            .with_tls(kafka.kafka_tls)
            .with_offset_reset(&consumer.kafka_consumer_offset_reset)
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
