use std::time::Duration;

use common_kafka::{DeliveryReport, Partition, RebalanceNotification, TransportFailure};
use health::HealthSignal;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AdapterError;
use crate::transport::TransportEvents;

const ENTITY: &str = "bus.rebalance";

/// Drives the group join and turns transport notifications into health signals.
///
/// Only assignment notifications and connectivity failures touch health:
/// an assignment re-arms `up`, a connectivity failure fires `down`, every
/// other failure is logged and ignored.
pub struct RebalanceCoordinator {
    topics: Vec<String>,
    consumer_health: HealthSignal,
    producer_health: HealthSignal,
    correlation_id: String,
}

impl RebalanceCoordinator {
    pub fn new(
        topics: Vec<String>,
        consumer_health: HealthSignal,
        producer_health: HealthSignal,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            topics,
            consumer_health,
            producer_health,
            correlation_id: correlation_id.into(),
        }
    }

    /// True for a non-empty assignment with at least one partition of every topic.
    pub fn claims(notification: &RebalanceNotification, topics: &[String]) -> bool {
        match notification {
            RebalanceNotification::Assigned(partitions) => covers(partitions, topics),
            RebalanceNotification::Revoked(_) => false,
        }
    }

    /// Waits for the first notification that claims every topic, then fires
    /// `up` once for both entities.
    pub async fn wait_for_claim(
        &self,
        notifications: &mut UnboundedReceiver<RebalanceNotification>,
        timeout: Duration,
    ) -> Result<Vec<Partition>, AdapterError> {
        let topics = &self.topics;
        let wait = async {
            while let Some(notification) = notifications.recv().await {
                match notification {
                    RebalanceNotification::Assigned(partitions) if covers(&partitions, topics) => {
                        return Ok(partitions);
                    }
                    other => info!(
                        entity = ENTITY,
                        correlation_id = %self.correlation_id,
                        "rebalance does not claim all of {:?} yet: {:?}",
                        topics,
                        other
                    ),
                }
            }
            Err(AdapterError::NotificationsClosed)
        };

        let partitions = match tokio::time::timeout(timeout, wait).await {
            Ok(claimed) => claimed?,
            Err(_) => {
                return Err(AdapterError::ClaimTimeout {
                    topics: self.topics.clone(),
                    timeout,
                })
            }
        };

        info!(
            entity = ENTITY,
            correlation_id = %self.correlation_id,
            "rebalance ok, claimed {} partitions of {:?}",
            partitions.len(),
            self.topics
        );
        self.consumer_health.up();
        self.producer_health.up();
        Ok(partitions)
    }

    /// Spawns the steady-state listeners. They stop when `stop` is cancelled or
    /// their stream closes.
    pub fn spawn_listeners(
        self,
        events: TransportEvents,
        stop: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let TransportEvents {
            notifications,
            consumer_failures,
            producer_failures,
            deliveries,
        } = events;

        vec![
            tokio::spawn(watch_notifications(
                notifications,
                self.consumer_health.clone(),
                self.correlation_id.clone(),
                stop.clone(),
            )),
            tokio::spawn(watch_failures(
                consumer_failures,
                self.consumer_health.clone(),
                self.correlation_id.clone(),
                stop.clone(),
            )),
            tokio::spawn(watch_failures(
                producer_failures,
                self.producer_health.clone(),
                self.correlation_id.clone(),
                stop.clone(),
            )),
            tokio::spawn(watch_deliveries(deliveries, self.producer_health, stop)),
        ]
    }
}

fn covers(partitions: &[Partition], topics: &[String]) -> bool {
    !partitions.is_empty()
        && topics.iter().all(|topic| {
            partitions
                .iter()
                .any(|partition| partition.topic() == topic)
        })
}

async fn watch_notifications(
    mut notifications: UnboundedReceiver<RebalanceNotification>,
    health: HealthSignal,
    correlation_id: String,
    stop: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = stop.cancelled() => return,
            notification = notifications.recv() => match notification {
                Some(notification) => notification,
                None => return,
            },
        };

        match notification {
            RebalanceNotification::Assigned(partitions) => {
                info!(
                    entity = ENTITY,
                    correlation_id = %correlation_id,
                    "rebalance ok, now claiming {} partitions",
                    partitions.len()
                );
                health.up();
            }
            RebalanceNotification::Revoked(partitions) => {
                info!(
                    entity = ENTITY,
                    correlation_id = %correlation_id,
                    "rebalance started, releasing {} partitions",
                    partitions.len()
                );
            }
        }
    }
}

/// Applies one transport failure to `health`. Returns true when it fired `down`.
pub fn apply_failure(
    failure: &TransportFailure,
    health: &HealthSignal,
    correlation_id: &str,
) -> bool {
    if failure.is_connectivity() {
        warn!(
            entity = ENTITY,
            correlation_id = %correlation_id,
            "{} lost connectivity: {}",
            health.entity(),
            failure
        );
        health.down();
        true
    } else {
        info!(
            entity = ENTITY,
            correlation_id = %correlation_id,
            "{} non-fatal transport error: {}",
            health.entity(),
            failure
        );
        false
    }
}

async fn watch_failures(
    mut failures: UnboundedReceiver<TransportFailure>,
    health: HealthSignal,
    correlation_id: String,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            failure = failures.recv() => match failure {
                Some(failure) => {
                    apply_failure(&failure, &health, &correlation_id);
                }
                None => return,
            },
        }
    }
}

async fn watch_deliveries(
    mut deliveries: UnboundedReceiver<DeliveryReport>,
    health: HealthSignal,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            report = deliveries.recv() => match report {
                Some(DeliveryReport::Delivered { .. }) => health.up(),
                Some(DeliveryReport::Failed { .. }) => {}
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use common_kafka::FailureKind;
    use health::{EntityStatus, HealthRelay};

    use super::*;
    use crate::test_utils::assert_or_retry;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_claim_requires_every_topic() {
        let wanted = topics(&["a", "b"]);
        let partial = RebalanceNotification::Assigned(vec![Partition::new("a", 0)]);
        let full = RebalanceNotification::Assigned(vec![
            Partition::new("a", 0),
            Partition::new("b", 3),
        ]);

        assert!(!RebalanceCoordinator::claims(&partial, &wanted));
        assert!(RebalanceCoordinator::claims(&full, &wanted));
        assert!(!RebalanceCoordinator::claims(
            &RebalanceNotification::Assigned(vec![]),
            &wanted
        ));
        assert!(!RebalanceCoordinator::claims(
            &RebalanceNotification::Revoked(vec![Partition::new("a", 0), Partition::new("b", 0)]),
            &wanted
        ));
    }

    #[tokio::test]
    async fn test_claim_brings_entities_up() {
        let mut relay = HealthRelay::new("test", "startup", Duration::from_millis(1));
        let consumer = relay.register("consumer", "test_consumer_health");
        let producer = relay.register("producer", "test_producer_health");
        let monitor = relay.start();

        let coordinator =
            RebalanceCoordinator::new(topics(&["listen-topic"]), consumer, producer, "startup");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(RebalanceNotification::Assigned(vec![])).unwrap();
        tx.send(RebalanceNotification::Assigned(vec![Partition::new(
            "listen-topic",
            0,
        )]))
        .unwrap();

        let partitions = coordinator
            .wait_for_claim(&mut rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(partitions, vec![Partition::new("listen-topic", 0)]);
        assert_or_retry(|| monitor.is_healthy()).await;
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_times_out() {
        let mut relay = HealthRelay::new("test", "startup", Duration::from_millis(1));
        let coordinator = RebalanceCoordinator::new(
            topics(&["listen-topic"]),
            relay.register("consumer", "m"),
            relay.register("producer", "m"),
            "startup",
        );
        let (_tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let err = coordinator
            .wait_for_claim(&mut rx, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::ClaimTimeout { .. }));
    }

    #[tokio::test]
    async fn test_failures_toggle_health() {
        let mut relay = HealthRelay::new("test", "startup", Duration::from_millis(1));
        let consumer = relay.register("consumer", "test_consumer_health");
        let monitor = relay.start();

        consumer.up();
        assert_or_retry(|| monitor.entity_status("consumer") == Some(EntityStatus::Up)).await;

        let noise = TransportFailure::new(FailureKind::Other, "unknown topic or partition");
        assert!(!apply_failure(&noise, &consumer, "startup"));

        let timeout = TransportFailure::from_message("read tcp 10.0.0.1:9092: i/o timeout");
        assert!(apply_failure(&timeout, &consumer, "startup"));
        assert_or_retry(|| monitor.entity_status("consumer") == Some(EntityStatus::Down)).await;
        assert_or_retry(|| !monitor.is_healthy()).await;
        monitor.stop();
    }

    #[tokio::test]
    async fn test_listeners_re_arm_on_assignment() {
        let mut relay = HealthRelay::new("test", "startup", Duration::from_millis(1));
        let consumer = relay.register("consumer", "test_consumer_health");
        let producer = relay.register("producer", "test_producer_health");
        let monitor = relay.start();

        let (notifications_tx, notifications) = tokio::sync::mpsc::unbounded_channel();
        let (consumer_failures_tx, consumer_failures) = tokio::sync::mpsc::unbounded_channel();
        let (_producer_failures_tx, producer_failures) = tokio::sync::mpsc::unbounded_channel();
        let (deliveries_tx, deliveries) = tokio::sync::mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let tasks = RebalanceCoordinator::new(
            topics(&["listen-topic"]),
            consumer,
            producer,
            "startup",
        )
        .spawn_listeners(
            TransportEvents {
                notifications,
                consumer_failures,
                producer_failures,
                deliveries,
            },
            stop.clone(),
        );

        deliveries_tx
            .send(DeliveryReport::Delivered {
                topic: "send-topic".to_string(),
            })
            .unwrap();
        consumer_failures_tx
            .send(TransportFailure::new(
                FailureKind::Connectivity,
                "1/1 brokers are down",
            ))
            .unwrap();
        assert_or_retry(|| monitor.entity_status("consumer") == Some(EntityStatus::Down)).await;
        assert_or_retry(|| monitor.entity_status("producer") == Some(EntityStatus::Up)).await;

        notifications_tx
            .send(RebalanceNotification::Assigned(vec![Partition::new(
                "listen-topic",
                1,
            )]))
            .unwrap();
        assert_or_retry(|| monitor.is_healthy()).await;

        stop.cancel();
        for task in tasks {
            task.await.unwrap();
        }
        monitor.stop();
    }
}
