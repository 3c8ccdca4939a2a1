use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::types::{Partition, RebalanceNotification, TransportFailure};

pub type NotificationSender = mpsc::UnboundedSender<RebalanceNotification>;
pub type FailureSender = mpsc::UnboundedSender<TransportFailure>;

fn forward_failure(failures: &FailureSender, error: KafkaError, reason: &str) {
    let failure = TransportFailure::from_kafka(&error, reason);
    if failure.is_connectivity() {
        warn!(entity = "bus.kafka", "connectivity failure: {}", failure);
    } else {
        error!(entity = "bus.kafka", "client error: {}", failure);
    }
    if failures.send(failure).is_err() {
        debug!("failure listener is gone, dropping client error");
    }
}

/// Consumer context forwarding group ownership changes and client errors
/// to async listeners. Callbacks run on the polling thread, so they only
/// enqueue.
pub struct GroupConsumerContext {
    notifications: NotificationSender,
    failures: FailureSender,
}

impl GroupConsumerContext {
    pub fn new(notifications: NotificationSender, failures: FailureSender) -> Self {
        Self {
            notifications,
            failures,
        }
    }

    fn notify(&self, notification: RebalanceNotification) {
        if self.notifications.send(notification).is_err() {
            debug!("rebalance listener is gone, dropping notification");
        }
    }
}

impl ClientContext for GroupConsumerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        forward_failure(&self.failures, error, reason);
    }
}

impl ConsumerContext for GroupConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(
                entity = "bus.rebalance",
                "revoking {} partitions",
                partitions.count()
            );
            let partitions = partitions
                .elements()
                .into_iter()
                .map(Partition::from)
                .collect();
            self.notify(RebalanceNotification::Revoked(partitions));
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(
                    entity = "bus.rebalance",
                    "assigned {} partitions",
                    partitions.count()
                );
                let partitions = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                self.notify(RebalanceNotification::Assigned(partitions));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!(entity = "bus.rebalance", "rebalance error: {}", e);
            }
        }
    }
}

/// Producer context: client errors only, delivery results are awaited per record.
pub struct ProducerContext {
    failures: FailureSender,
}

impl ProducerContext {
    pub fn new(failures: FailureSender) -> Self {
        Self { failures }
    }
}

impl ClientContext for ProducerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        forward_failure(&self.failures, error, reason);
    }
}
