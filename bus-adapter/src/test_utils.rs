//! In-memory transport and log capture for tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{
    DeliveryReport, InboundRecord, OutboundRecord, Partition, RebalanceNotification,
    RecordHeader, TransportFailure,
};
use envconfig::Envconfig;
use health::{HealthMonitor, HealthRelay, HealthSignal};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;
use uuid::Uuid;

use crate::config::Config;
use crate::context::AppContext;
use crate::error::TransportError;
use crate::facade::PortAdapter;
use crate::message::{MESSAGE_ID_HEADER, TYPE_HEADER};
use crate::transport::{RecordSink, RecordSource, TransportEvents, TransportHandles};

/// Context built from the default configuration.
pub fn test_context() -> Arc<AppContext> {
    AppContext::new(test_config())
}

pub fn test_config() -> Config {
    Config::init_from_hashmap(&HashMap::new()).expect("default config is valid")
}

/// A record on `listen-topic` with a `Type` header and a fresh `Message-ID`.
pub fn typed_record(message_type: &str) -> InboundRecord {
    InboundRecord {
        topic: "listen-topic".to_string(),
        partition: 0,
        offset: 0,
        headers: vec![
            RecordHeader::new(TYPE_HEADER, message_type),
            RecordHeader::new(MESSAGE_ID_HEADER, Uuid::now_v7().as_bytes().to_vec()),
        ],
        payload: b"{}".to_vec(),
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct MemorySource {
    records: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundRecord>>,
    pending: Arc<AtomicUsize>,
    marked: Mutex<Vec<i64>>,
    closed: AtomicBool,
    topics: Vec<String>,
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn recv(&self) -> Result<InboundRecord, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let record = self
            .records
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(record)
    }

    fn mark_consumed(&self, record: &InboundRecord) -> Result<(), TransportError> {
        self.marked
            .lock()
            .expect("poisoned")
            .push(record.offset + 1);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn topics(&self) -> Vec<String> {
        self.topics.clone()
    }
}

#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<OutboundRecord>>,
    reject: AtomicBool,
}

impl RecordSink for MemorySink {
    fn enqueue(&self, record: OutboundRecord) -> Result<(), TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("queue full".to_string()));
        }
        self.sent.lock().expect("poisoned").push(record);
        Ok(())
    }
}

/// Stands in for the broker: feeds records and notifications to an adapter
/// and keeps everything it publishes.
pub struct MemoryTransport {
    source: Arc<MemorySource>,
    sink: Arc<MemorySink>,
    feed: mpsc::UnboundedSender<InboundRecord>,
    pending: Arc<AtomicUsize>,
    notifications: mpsc::UnboundedSender<RebalanceNotification>,
    consumer_failures: mpsc::UnboundedSender<TransportFailure>,
    producer_failures: mpsc::UnboundedSender<TransportFailure>,
    deliveries: mpsc::UnboundedSender<DeliveryReport>,
    events: Mutex<Option<TransportEvents>>,
    relay: Mutex<Option<HealthRelay>>,
    consumer_health: HealthSignal,
    producer_health: HealthSignal,
}

impl MemoryTransport {
    pub fn new(topics: &[&str]) -> Self {
        let (feed, records) = mpsc::unbounded_channel();
        let (notifications, notifications_rx) = mpsc::unbounded_channel();
        let (consumer_failures, consumer_failures_rx) = mpsc::unbounded_channel();
        let (producer_failures, producer_failures_rx) = mpsc::unbounded_channel();
        let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let mut relay = HealthRelay::new("bus_adapter_test", "test", Duration::from_millis(1));
        let consumer_health = relay.register("consumer", "bus_adapter_test_health");
        let producer_health = relay.register("producer", "bus_adapter_test_health");

        Self {
            source: Arc::new(MemorySource {
                records: tokio::sync::Mutex::new(records),
                pending: pending.clone(),
                marked: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                topics: topics.iter().map(|topic| topic.to_string()).collect(),
            }),
            sink: Arc::new(MemorySink::default()),
            feed,
            pending,
            notifications,
            consumer_failures,
            producer_failures,
            deliveries,
            events: Mutex::new(Some(TransportEvents {
                notifications: notifications_rx,
                consumer_failures: consumer_failures_rx,
                producer_failures: producer_failures_rx,
                deliveries: deliveries_rx,
            })),
            relay: Mutex::new(Some(relay)),
            consumer_health,
            producer_health,
        }
    }

    pub fn handles(&self) -> TransportHandles {
        TransportHandles {
            source: self.source.clone(),
            sink: self.sink.clone(),
        }
    }

    /// Builds an adapter over this transport. Can only be called once.
    pub fn adapter(&self, context: Arc<AppContext>) -> PortAdapter {
        let events = self
            .events
            .lock()
            .expect("poisoned")
            .take()
            .expect("adapter already built for this transport");
        PortAdapter::with_transport(
            context,
            self.handles(),
            events,
            self.consumer_health.clone(),
            self.producer_health.clone(),
        )
    }

    /// Starts the health relay behind the adapter's signals.
    pub fn start_health(&self) -> HealthMonitor {
        self.relay
            .lock()
            .expect("poisoned")
            .take()
            .expect("health relay already started")
            .start()
    }

    pub fn consumer_signal(&self) -> HealthSignal {
        self.consumer_health.clone()
    }

    pub fn publish(&self, record: InboundRecord) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.feed.send(record).expect("source dropped");
    }

    /// Assigns partition 0 of every topic.
    pub fn claim_all(&self) {
        let partitions = self
            .source
            .topics
            .iter()
            .map(|topic| Partition::new(topic.as_str(), 0))
            .collect();
        self.notify(RebalanceNotification::Assigned(partitions));
    }

    pub fn notify(&self, notification: RebalanceNotification) {
        self.notifications
            .send(notification)
            .expect("notifications dropped");
    }

    pub fn fail_consumer(&self, message: &str) {
        self.consumer_failures
            .send(TransportFailure::from_message(message))
            .expect("consumer failures dropped");
    }

    pub fn fail_producer(&self, message: &str) {
        self.producer_failures
            .send(TransportFailure::from_message(message))
            .expect("producer failures dropped");
    }

    pub fn deliver(&self, topic: &str) {
        self.deliveries
            .send(DeliveryReport::Delivered {
                topic: topic.to_string(),
            })
            .expect("deliveries dropped");
    }

    pub fn reject_sends(&self, reject: bool) {
        self.sink.reject.store(reject, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.sink.sent.lock().expect("poisoned").clone()
    }

    pub fn marked_offsets(&self) -> Vec<i64> {
        self.source.marked.lock().expect("poisoned").clone()
    }

    pub fn pending_records(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.source.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

/// Records every event emitted while installed.
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the capture for the current thread. Pair with a current-thread
    /// runtime so spawned tasks are captured too.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().expect("poisoned").clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }

    pub fn matching(&self, level: Level, needle: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);
        self.events.lock().expect("poisoned").push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.fields.insert(field.name().to_owned(), value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_owned(), format!("{value:?}"));
        }
    }
}
