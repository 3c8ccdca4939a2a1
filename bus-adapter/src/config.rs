use std::str::FromStr;
use std::time;

use common_kafka::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9000")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "send-topic")]
    pub kafka_producer_topic: String,

    #[envconfig(default = "1000")]
    pub max_consumer_jobs: usize,

    #[envconfig(from = "CONSTRUCTION_TIMEOUT_MS", default = "10000")]
    pub construction_timeout: EnvMsDuration,

    #[envconfig(from = "CONSTRUCTION_RETRY_INTERVAL_MS", default = "500")]
    pub construction_retry_interval: EnvMsDuration,

    #[envconfig(from = "REBALANCE_TIMEOUT_MS", default = "60000")]
    pub rebalance_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub shutdown: ShutdownConfig,

    #[envconfig(from = "HEALTH_AGGREGATE_INTERVAL_MS", default = "50")]
    pub health_aggregate_interval: EnvMsDuration,

    // Value of the outbound routing header
    #[envconfig(default = "some")]
    pub program_tag: String,

    #[envconfig(default = "default")]
    pub log_format: LogFormat,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn listen_topics(&self) -> &[String] {
        self.consumer.kafka_consumer_topics.as_slice()
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ShutdownConfig {
    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub timeout: EnvMsDuration,

    #[envconfig(from = "SHUTDOWN_POLL_INTERVAL_MS", default = "500")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "SHUTDOWN_SETTLE_MS", default = "100")]
    pub settle: EnvMsDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Default,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl std::fmt::Display for ParseLogFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown log format: {}", self.0)
    }
}

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" | "text" => Ok(LogFormat::Default),
            "json" => Ok(LogFormat::Json),
            other => Err(ParseLogFormatError(other.to_owned())),
        }
    }
}
