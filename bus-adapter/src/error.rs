use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka operation failed: {0}")]
    Kafka(#[from] KafkaError),
    #[error("record source is closed")]
    Closed,
    #[error("record rejected by producer queue: {0}")]
    Rejected(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// A record whose headers cannot be turned into a message.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("{0} header is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("{header} header is not a valid uuid: {reason}")]
    InvalidUuid {
        header: &'static str,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("transport construction did not succeed within {0:?}")]
    ConstructionTimeout(Duration),
    #[error("no partitions claimed for {topics:?} within {timeout:?}")]
    ClaimTimeout {
        topics: Vec<String>,
        timeout: Duration,
    },
    #[error("rebalance notifications closed before partitions were claimed")]
    NotificationsClosed,
    #[error("handler already registered for message type {0}")]
    DuplicateHandler(String),
    #[error("monitoring listener is not reachable: {0}")]
    Monitoring(#[source] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
