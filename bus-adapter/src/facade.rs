use std::sync::Arc;

use health::HealthSignal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::dispatcher::Dispatcher;
use crate::error::{AdapterError, TransportError};
use crate::jobs::JobTracker;
use crate::message::OutboundMessage;
use crate::rebalance::RebalanceCoordinator;
use crate::registry::{HandlerRegistry, MessageHandler};
use crate::shutdown::{DrainOutcome, DrainSettings, ShutdownCoordinator};
use crate::transport::{RecordSink, TransportEvents, TransportHandles};

const ENTITY: &str = "bus.adapter";

/// Publishes messages to the send topic without waiting for the broker.
#[derive(Clone)]
pub struct Publisher {
    sink: Arc<dyn RecordSink>,
    topic: String,
    context: Arc<AppContext>,
}

impl Publisher {
    /// Stamps a fresh Message-ID plus routing headers and enqueues the record.
    /// Only a local enqueue failure is returned; the broker outcome is logged.
    pub fn send(&self, message: OutboundMessage) -> Result<Uuid, TransportError> {
        let message_id = self.context.ids.new_id();
        let correlation_id = message
            .correlation_id
            .clone()
            .unwrap_or_else(|| message_id.to_string());
        let message_type = message.message_type.clone();
        let record = message.into_record(message_id, &self.topic, &self.context.program_tag);

        match self.sink.enqueue(record) {
            Ok(()) => {
                info!(
                    entity = "bus.producer",
                    correlation_id = %correlation_id,
                    "message {} queued for {}, type: {}",
                    message_id,
                    self.topic,
                    message_type
                );
                Ok(message_id)
            }
            Err(e) => {
                error!(
                    entity = "bus.producer",
                    correlation_id = %correlation_id,
                    "can't queue message of type {}: {}",
                    message_type,
                    e
                );
                Err(e)
            }
        }
    }
}

/// A connected adapter that is not consuming yet. Handlers are registered
/// here, before [`PortAdapter::start`] freezes the registry.
pub struct PortAdapter {
    context: Arc<AppContext>,
    registry: HandlerRegistry,
    handles: TransportHandles,
    events: TransportEvents,
    jobs: Arc<JobTracker>,
    consumer_health: HealthSignal,
    producer_health: HealthSignal,
    correlation_id: String,
}

impl PortAdapter {
    /// Opens the transport, retrying until the construction timeout.
    pub async fn connect(
        context: Arc<AppContext>,
        consumer_health: HealthSignal,
        producer_health: HealthSignal,
    ) -> Result<Self, AdapterError> {
        let correlation_id = context.ids.new_job_id();
        let config = &context.config;
        info!(
            entity = ENTITY,
            correlation_id = %correlation_id,
            "connecting to {} as group {}",
            config.kafka.kafka_hosts,
            config.consumer.kafka_consumer_group
        );

        let (handles, events) = TransportHandles::open_with_retry(
            &config.kafka,
            &config.consumer,
            config.construction_retry_interval.0,
            config.construction_timeout.0,
            &correlation_id,
        )
        .await?;

        Ok(Self::assemble(
            context,
            handles,
            events,
            consumer_health,
            producer_health,
            correlation_id,
        ))
    }

    /// Builds an adapter over transport handles that are already open.
    pub fn with_transport(
        context: Arc<AppContext>,
        handles: TransportHandles,
        events: TransportEvents,
        consumer_health: HealthSignal,
        producer_health: HealthSignal,
    ) -> Self {
        let correlation_id = context.ids.new_job_id();
        Self::assemble(
            context,
            handles,
            events,
            consumer_health,
            producer_health,
            correlation_id,
        )
    }

    fn assemble(
        context: Arc<AppContext>,
        handles: TransportHandles,
        events: TransportEvents,
        consumer_health: HealthSignal,
        producer_health: HealthSignal,
        correlation_id: String,
    ) -> Self {
        Self {
            context,
            registry: HandlerRegistry::new(),
            handles,
            events,
            jobs: JobTracker::new(),
            consumer_health,
            producer_health,
            correlation_id,
        }
    }

    pub fn subscribe(
        &mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AdapterError> {
        let message_type = message_type.into();
        info!(
            entity = ENTITY,
            correlation_id = %self.correlation_id,
            "subscribed handler for {}",
            message_type
        );
        self.registry.register(message_type, handler)
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            sink: self.handles.sink.clone(),
            topic: self.context.config.kafka_producer_topic.clone(),
            context: self.context.clone(),
        }
    }

    pub fn jobs(&self) -> Arc<JobTracker> {
        self.jobs.clone()
    }

    /// Starts consuming and waits for the group to claim every topic.
    ///
    /// The receive loop starts first: with librdkafka, rebalance callbacks
    /// only run while the consumer is polled. If no claim arrives in time the
    /// loop is stopped and the error returned.
    pub async fn start(self) -> Result<RunningAdapter, AdapterError> {
        let publisher = self.publisher();
        let PortAdapter {
            context,
            registry,
            handles,
            mut events,
            jobs,
            consumer_health,
            producer_health,
            correlation_id,
        } = self;

        if registry.is_empty() {
            warn!(
                entity = ENTITY,
                correlation_id = %correlation_id,
                "starting without handlers, every record will be dropped"
            );
        } else {
            info!(
                entity = ENTITY,
                correlation_id = %correlation_id,
                "starting with {} handlers for {:?}",
                registry.len(),
                registry.message_types()
            );
        }

        let stop_receiving = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            handles.source.clone(),
            Arc::new(registry),
            jobs.clone(),
            context.clone(),
            consumer_health.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(stop_receiving.clone()));

        let coordinator = RebalanceCoordinator::new(
            handles.source.topics(),
            consumer_health,
            producer_health,
            correlation_id.clone(),
        );
        if let Err(e) = coordinator
            .wait_for_claim(&mut events.notifications, context.config.rebalance_timeout.0)
            .await
        {
            error!(
                entity = ENTITY,
                correlation_id = %correlation_id,
                "can't start consuming: {}",
                e
            );
            stop_receiving.cancel();
            if let Err(join_error) = dispatcher.await {
                warn!(entity = ENTITY, "dispatcher task failed: {}", join_error);
            }
            return Err(e);
        }

        let stop_listeners = CancellationToken::new();
        let listeners = coordinator.spawn_listeners(events, stop_listeners.clone());

        Ok(RunningAdapter {
            publisher,
            jobs,
            stop_receiving,
            stop_listeners,
            dispatcher,
            listeners,
            drain: DrainSettings::from(&context.config.shutdown),
            correlation_id,
        })
    }
}

/// A consuming adapter. Dropping it leaves the tasks running; call
/// [`RunningAdapter::shutdown`] to drain.
pub struct RunningAdapter {
    publisher: Publisher,
    jobs: Arc<JobTracker>,
    stop_receiving: CancellationToken,
    stop_listeners: CancellationToken,
    dispatcher: JoinHandle<()>,
    listeners: Vec<JoinHandle<()>>,
    drain: DrainSettings,
    correlation_id: String,
}

impl RunningAdapter {
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn jobs(&self) -> Arc<JobTracker> {
        self.jobs.clone()
    }

    /// Stops receiving, drains in-flight jobs, then stops the listeners.
    pub async fn shutdown(self) -> DrainOutcome {
        let outcome = ShutdownCoordinator::new(
            self.jobs.clone(),
            self.stop_receiving.clone(),
            self.drain,
            self.correlation_id.clone(),
        )
        .drain()
        .await;

        if let Err(e) = self.dispatcher.await {
            warn!(entity = ENTITY, "dispatcher task failed: {}", e);
        }
        self.stop_listeners.cancel();
        for listener in self.listeners {
            if let Err(e) = listener.await {
                warn!(entity = ENTITY, "listener task failed: {}", e);
            }
        }
        outcome
    }

    /// Runs [`RunningAdapter::shutdown`] once `shutdown` is cancelled and
    /// reports the outcome on the returned channel.
    pub fn spawn_watcher(self, shutdown: CancellationToken) -> oneshot::Receiver<DrainOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            let outcome = self.shutdown().await;
            if done_tx.send(outcome).is_err() {
                info!(entity = ENTITY, "nobody is waiting for the drain outcome");
            }
        });
        done_rx
    }
}
