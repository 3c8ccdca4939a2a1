pub mod config;
pub mod consumer;
pub mod context;
pub mod producer;
pub mod types;

pub use config::{ConsumerConfig, ConsumerConfigBuilder, KafkaConfig, TopicList};
pub use consumer::{ConsumerEvents, GroupConsumer};
pub use producer::{AsyncProducer, ProducerEvents};
pub use types::{
    DeliveryReport, FailureKind, InboundRecord, OutboundRecord, Partition, RebalanceNotification,
    RecordHeader, TransportFailure,
};
