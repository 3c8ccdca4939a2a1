use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, ConsumerConfigBuilder, KafkaConfig};
use crate::context::GroupConsumerContext;
use crate::types::{InboundRecord, RebalanceNotification, TransportFailure};

/// Async streams fed by the consumer's callbacks.
pub struct ConsumerEvents {
    pub notifications: mpsc::UnboundedReceiver<RebalanceNotification>,
    pub failures: mpsc::UnboundedReceiver<TransportFailure>,
}

/// Group member subscribed to a fixed set of topics.
///
/// Offsets are never stored implicitly; callers mark each record once it has
/// been handed off, and the client commits stored offsets in the background.
pub struct GroupConsumer {
    inner: StreamConsumer<GroupConsumerContext>,
    topics: Vec<String>,
}

impl GroupConsumer {
    pub fn new(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
    ) -> Result<(Self, ConsumerEvents), KafkaError> {
        let (notifications_tx, notifications) = mpsc::unbounded_channel();
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let context = GroupConsumerContext::new(notifications_tx, failures_tx);

        let client_config = ConsumerConfigBuilder::from_config(kafka, consumer).build();
        debug!("rdkafka consumer configuration: {:?}", client_config);
        let inner: StreamConsumer<GroupConsumerContext> =
            client_config.create_with_context(context)?;

        let topics = consumer.kafka_consumer_topics.as_slice().to_vec();
        let subscription: Vec<&str> = topics.iter().map(String::as_str).collect();
        inner.subscribe(&subscription)?;
        info!(
            entity = "bus.consumer",
            group = %consumer.kafka_consumer_group,
            "subscribed to {:?}",
            topics
        );

        Ok((
            Self { inner, topics },
            ConsumerEvents {
                notifications,
                failures,
            },
        ))
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Waits for the next record. Polling here also drives rebalance callbacks.
    pub async fn recv(&self) -> Result<InboundRecord, KafkaError> {
        let message = self.inner.recv().await?;
        Ok(InboundRecord::from_message(&message))
    }

    /// Stores `offset + 1` so a restart resumes after this record.
    pub fn mark_consumed(&self, record: &InboundRecord) -> Result<(), KafkaError> {
        self.inner
            .store_offset(&record.topic, record.partition, record.offset + 1)
    }

    pub fn close(&self) {
        info!(entity = "bus.consumer", "leaving consumer group");
        self.inner.unsubscribe();
    }
}
