use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::KafkaConfig;
use crate::context::ProducerContext;
use crate::types::{DeliveryReport, OutboundRecord, TransportFailure};

pub struct ProducerEvents {
    pub failures: mpsc::UnboundedReceiver<TransportFailure>,
    pub deliveries: mpsc::UnboundedReceiver<DeliveryReport>,
}

/// Fire-and-forget producer. Delivery results are logged from a detached task
/// and reported on the deliveries stream, never back to the caller.
#[derive(Clone)]
pub struct AsyncProducer {
    inner: FutureProducer<ProducerContext>,
    deliveries: mpsc::UnboundedSender<DeliveryReport>,
}

impl AsyncProducer {
    /// Creates the client and "pings" the brokers by requesting metadata, so an
    /// unreachable cluster fails construction.
    pub fn new(config: &KafkaConfig) -> Result<(Self, ProducerEvents), KafkaError> {
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries) = mpsc::unbounded_channel();
        let client_config = config.producer_client_config();
        debug!("rdkafka producer configuration: {:?}", client_config);
        let inner: FutureProducer<ProducerContext> =
            client_config.create_with_context(ProducerContext::new(failures_tx))?;

        match inner.client().fetch_metadata(None, config.metadata_timeout()) {
            Ok(metadata) => {
                info!(
                    entity = "bus.producer",
                    "connected to Kafka brokers, found {} topics",
                    metadata.topics().len()
                );
            }
            Err(e) => {
                error!(
                    entity = "bus.producer",
                    "failed to fetch metadata from Kafka brokers: {:?}", e
                );
                return Err(e);
            }
        }

        Ok((
            Self {
                inner,
                deliveries: deliveries_tx,
            },
            ProducerEvents {
                failures,
                deliveries,
            },
        ))
    }

    /// Hands the record to the client queue. Only a full or closed local queue
    /// is reported; the broker outcome is logged asynchronously.
    pub fn enqueue(&self, record: OutboundRecord) -> Result<(), KafkaError> {
        let headers = record.owned_headers();
        let delivery = self
            .inner
            .send_result(
                FutureRecord::<(), [u8]>::to(&record.topic)
                    .payload(&record.payload)
                    .headers(headers),
            )
            .map_err(|(e, _)| e)?;

        let topic = record.topic;
        let deliveries = self.deliveries.clone();
        tokio::spawn(async move {
            let report = match delivery.await {
                Ok(Ok(_)) => {
                    trace!(entity = "bus.producer", "message sent to topic {}", topic);
                    metrics::counter!("bus_adapter_messages_sent_total").increment(1);
                    DeliveryReport::Delivered { topic }
                }
                Ok(Err((e, _))) => {
                    warn!(
                        entity = "bus.producer",
                        "failed to send message to topic {}: {}", topic, e
                    );
                    metrics::counter!("bus_adapter_send_failures_total").increment(1);
                    DeliveryReport::Failed {
                        topic,
                        reason: e.to_string(),
                    }
                }
                Err(_) => {
                    warn!(
                        entity = "bus.producer",
                        "delivery report for topic {} was dropped", topic
                    );
                    metrics::counter!("bus_adapter_send_failures_total").increment(1);
                    DeliveryReport::Failed {
                        topic,
                        reason: "delivery canceled".to_string(),
                    }
                }
            };
            if deliveries.send(report).is_err() {
                trace!("delivery listener is gone");
            }
        });

        Ok(())
    }
}
