use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{
    AsyncProducer, ConsumerConfig, ConsumerEvents, DeliveryReport, GroupConsumer, InboundRecord,
    KafkaConfig, OutboundRecord, ProducerEvents, RebalanceNotification, TransportFailure,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::{AdapterError, TransportError};

/// Read side of the transport.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Waits for the next record.
    async fn recv(&self) -> Result<InboundRecord, TransportError>;

    /// Records the position after `record` for the next offset commit.
    fn mark_consumed(&self, record: &InboundRecord) -> Result<(), TransportError>;

    /// Closes the read path. Records already handed out are unaffected.
    fn close(&self);

    fn topics(&self) -> Vec<String>;
}

/// Write side of the transport. Never waits for the broker.
pub trait RecordSink: Send + Sync {
    fn enqueue(&self, record: OutboundRecord) -> Result<(), TransportError>;
}

/// Notification streams produced by the clients' callbacks.
pub struct TransportEvents {
    pub notifications: mpsc::UnboundedReceiver<RebalanceNotification>,
    pub consumer_failures: mpsc::UnboundedReceiver<TransportFailure>,
    pub producer_failures: mpsc::UnboundedReceiver<TransportFailure>,
    pub deliveries: mpsc::UnboundedReceiver<DeliveryReport>,
}

/// The consumer-group and producer connections.
#[derive(Clone)]
pub struct TransportHandles {
    pub source: Arc<dyn RecordSource>,
    pub sink: Arc<dyn RecordSink>,
}

impl TransportHandles {
    /// Connects both clients. The producer pings the brokers, so an
    /// unreachable cluster fails here rather than at the first send.
    pub fn open(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
    ) -> Result<(Self, TransportEvents), TransportError> {
        let (
            producer,
            ProducerEvents {
                failures: producer_failures,
                deliveries,
            },
        ) = AsyncProducer::new(kafka)?;
        let (
            consumer,
            ConsumerEvents {
                notifications,
                failures: consumer_failures,
            },
        ) = GroupConsumer::new(kafka, consumer)?;

        Ok((
            Self {
                source: Arc::new(consumer),
                sink: Arc::new(producer),
            },
            TransportEvents {
                notifications,
                consumer_failures,
                producer_failures,
                deliveries,
            },
        ))
    }

    /// Retries [`TransportHandles::open`] off the async threads until it
    /// succeeds or `timeout` elapses.
    pub async fn open_with_retry(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        retry_interval: Duration,
        timeout: Duration,
        correlation_id: &str,
    ) -> Result<(Self, TransportEvents), AdapterError> {
        retry_construction(retry_interval, timeout, correlation_id, || {
            let kafka = kafka.clone();
            let consumer = consumer.clone();
            async move {
                tokio::task::spawn_blocking(move || Self::open(&kafka, &consumer))
                    .await
                    .unwrap_or_else(|e| Err(TransportError::Setup(e.to_string())))
            }
        })
        .await
    }
}

/// Runs `attempt` immediately and then on every `retry_interval` tick until it
/// succeeds. Gives up with [`AdapterError::ConstructionTimeout`] once `timeout`
/// has elapsed, abandoning an attempt that is still running.
pub async fn retry_construction<T, E, F, Fut>(
    retry_interval: Duration,
    timeout: Duration,
    correlation_id: &str,
    mut attempt: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let deadline = Instant::now() + timeout;
    let mut ticker = interval(retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0_u32;

    loop {
        tokio::select! {
            biased;
            _ = sleep_until(deadline) => break,
            _ = ticker.tick() => {}
        }

        attempts += 1;
        let Ok(outcome) = timeout_at(deadline, attempt()).await else {
            warn!(
                entity = "bus.adapter",
                correlation_id = %correlation_id,
                "transport attempt {} still running at the construction deadline",
                attempts
            );
            break;
        };
        match outcome {
            Ok(value) => {
                info!(
                    entity = "bus.adapter",
                    correlation_id = %correlation_id,
                    "transport connected after {} attempts",
                    attempts
                );
                return Ok(value);
            }
            Err(e) => warn!(
                entity = "bus.adapter",
                correlation_id = %correlation_id,
                "can't connect transport (attempt {}): {}",
                attempts,
                e
            ),
        }
    }

    Err(AdapterError::ConstructionTimeout(timeout))
}

#[async_trait]
impl RecordSource for GroupConsumer {
    async fn recv(&self) -> Result<InboundRecord, TransportError> {
        Ok(GroupConsumer::recv(self).await?)
    }

    fn mark_consumed(&self, record: &InboundRecord) -> Result<(), TransportError> {
        Ok(GroupConsumer::mark_consumed(self, record)?)
    }

    fn close(&self) {
        GroupConsumer::close(self)
    }

    fn topics(&self) -> Vec<String> {
        GroupConsumer::topics(self).to_vec()
    }
}

impl RecordSink for AsyncProducer {
    fn enqueue(&self, record: OutboundRecord) -> Result<(), TransportError> {
        AsyncProducer::enqueue(self, record).map_err(|e| match e {
            KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
                TransportError::Rejected(e.to_string())
            }
            other => TransportError::Kafka(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let value = retry_construction(
            Duration::from_millis(500),
            Duration::from_secs(10),
            "test",
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err("brokers unreachable")
                    } else {
                        Ok(call)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_at_timeout() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result: Result<(), AdapterError> = retry_construction(
            Duration::from_millis(500),
            Duration::from_secs(10),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("brokers unreachable") }
            },
        )
        .await;

        assert!(matches!(result, Err(AdapterError::ConstructionTimeout(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        // One immediate attempt, then one per tick before the deadline
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_does_not_outlive_timeout() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        // Every attempt would succeed, but only after 4s
        let result = retry_construction(
            Duration::from_millis(500),
            Duration::from_secs(10),
            "test",
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_secs(4)).await;
                    if call < 2 {
                        Err("brokers unreachable")
                    } else {
                        Ok(call)
                    }
                }
            },
        )
        .await;

        assert!(matches!(result, Err(AdapterError::ConstructionTimeout(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
