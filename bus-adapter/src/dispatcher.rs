use std::sync::Arc;
use std::time::Duration;

use common_kafka::InboundRecord;
use health::HealthSignal;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::error::TransportError;
use crate::jobs::{JobGuard, JobTracker};
use crate::message::InboundMessage;
use crate::registry::HandlerRegistry;
use crate::transport::RecordSource;

const ENTITY: &str = "bus.dispatcher";
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub const RECORDS_RECEIVED: &str = "bus_adapter_records_received_total";
pub const RECORDS_HANDLED: &str = "bus_adapter_records_handled_total";
pub const RECORDS_DECODE_FAILED: &str = "bus_adapter_records_decode_failed_total";
pub const RECORDS_UNROUTABLE: &str = "bus_adapter_records_unroutable_total";
pub const RECEIVE_ERRORS: &str = "bus_adapter_receive_errors_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    DecodeFailed,
    Unroutable,
}

/// The receive loop. Each record is registered as a job before a worker
/// task decodes and routes it; at most `max_jobs` records are in flight.
#[derive(Clone)]
pub struct Dispatcher {
    source: Arc<dyn RecordSource>,
    registry: Arc<HandlerRegistry>,
    jobs: Arc<JobTracker>,
    context: Arc<AppContext>,
    capacity: Arc<Semaphore>,
    consumer_health: HealthSignal,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn RecordSource>,
        registry: Arc<HandlerRegistry>,
        jobs: Arc<JobTracker>,
        context: Arc<AppContext>,
        consumer_health: HealthSignal,
    ) -> Self {
        let max_jobs = context.config.max_consumer_jobs.max(1);
        Self {
            source,
            registry,
            jobs,
            context,
            capacity: Arc::new(Semaphore::new(max_jobs)),
            consumer_health,
        }
    }

    /// Runs until `stop` is cancelled, then closes the read path. Workers
    /// already spawned keep running; the drain waits for them.
    pub async fn run(self, stop: CancellationToken) {
        info!(entity = ENTITY, "dispatcher started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = self.capacity.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = self.source.recv() => received,
            };

            match received {
                Ok(record) => self.spawn_worker(record, permit),
                Err(TransportError::Closed) => {
                    info!(entity = ENTITY, "record source closed");
                    break;
                }
                Err(e) => {
                    error!(entity = ENTITY, "failed to receive record: {}", e);
                    metrics::counter!(RECEIVE_ERRORS).increment(1);
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
            }
        }

        self.source.close();
        info!(entity = ENTITY, "dispatcher stopped receiving");
    }

    fn spawn_worker(&self, record: InboundRecord, permit: OwnedSemaphorePermit) {
        // Registered here, before the worker exists, so the drain always sees it.
        let job = self.jobs.track(self.context.ids.new_job_id());
        metrics::counter!(RECORDS_RECEIVED).increment(1);
        self.consumer_health.up();

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            dispatcher.process_record(record, job).await;
        });
    }

    /// Decodes and routes one record. `receive_job` is released on every path;
    /// a routed record is tracked under its correlation id while its handler runs.
    pub async fn process_record(
        &self,
        record: InboundRecord,
        receive_job: JobGuard,
    ) -> DispatchOutcome {
        if let Err(e) = self.source.mark_consumed(&record) {
            warn!(
                entity = ENTITY,
                correlation_id = receive_job.id(),
                "failed to store offset {} for {}/{}: {}",
                record.offset,
                record.topic,
                record.partition,
                e
            );
        }

        let message = match InboundMessage::decode(&record, &self.context.ids) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    entity = ENTITY,
                    correlation_id = receive_job.id(),
                    "can't decode record at {}/{} offset {}: {}",
                    record.topic,
                    record.partition,
                    record.offset,
                    e
                );
                metrics::counter!(RECORDS_DECODE_FAILED).increment(1);
                return DispatchOutcome::DecodeFailed;
            }
        };

        info!(
            entity = ENTITY,
            correlation_id = %message.correlation_id,
            "got new message, type: {}",
            message.message_type
        );

        let Some(handler) = self.registry.get(&message.message_type) else {
            error!(
                entity = ENTITY,
                correlation_id = %message.correlation_id,
                "unknown message type {}, can't handle that",
                message.message_type
            );
            metrics::counter!(RECORDS_UNROUTABLE).increment(1);
            return DispatchOutcome::Unroutable;
        };

        let message_job = self.jobs.track(message.correlation_id.clone());
        receive_job.release();

        handler.handle(message).await;

        message_job.release();
        metrics::counter!(RECORDS_HANDLED).increment(1);
        DispatchOutcome::Handled
    }
}
