use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bus_adapter::config::Config;
use bus_adapter::context::AppContext;
use bus_adapter::error::{AdapterError, TransportError};
use bus_adapter::message::{InboundMessage, OutboundMessage, IN_REPLY_TO_HEADER, TYPE_HEADER};
use bus_adapter::registry::MessageHandler;
use bus_adapter::shutdown::DrainOutcome;
use bus_adapter::test_utils::{
    assert_or_retry, test_context, typed_record, LogCapture, MemoryTransport,
};
use common_kafka::{Partition, RebalanceNotification};
use envconfig::Envconfig;
use health::EntityStatus;
use tracing::Level;
use uuid::Uuid;

#[derive(Default)]
struct Recording {
    calls: AtomicUsize,
    seen: Mutex<Vec<InboundMessage>>,
}

impl Recording {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for Recording {
    async fn handle(&self, message: InboundMessage) {
        self.seen.lock().unwrap().push(message);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn ping_is_handled_once_and_jobs_return_to_baseline() {
    let transport = MemoryTransport::new(&["listen-topic"]);
    let mut adapter = transport.adapter(test_context());
    let handler = Arc::new(Recording::default());
    adapter.subscribe("ping", handler.clone()).unwrap();

    let jobs = adapter.jobs();
    let baseline = jobs.size();

    transport.claim_all();
    let running = adapter.start().await.unwrap();

    let record = typed_record("ping");
    transport.publish(record.clone());

    assert_or_retry(|| handler.calls() == 1).await;
    assert_or_retry(|| jobs.size() == baseline).await;

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen[0].message_type, "ping");
    assert_eq!(
        seen[0].message_id.as_bytes().as_slice(),
        record.header("Message-ID").unwrap()
    );
    assert_eq!(transport.marked_offsets(), vec![1]);

    assert_eq!(running.shutdown().await, DrainOutcome::Clean);
    assert_eq!(handler.calls(), 1);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn unknown_type_is_logged_once_and_dropped() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let transport = MemoryTransport::new(&["listen-topic"]);
    let mut adapter = transport.adapter(test_context());
    let handler = Arc::new(Recording::default());
    adapter.subscribe("ping", handler.clone()).unwrap();
    let jobs = adapter.jobs();
    let baseline = jobs.size();

    transport.claim_all();
    let running = adapter.start().await.unwrap();
    transport.publish(typed_record("unknown-type"));

    assert_or_retry(|| logs.count(Level::ERROR) == 1).await;
    assert_or_retry(|| jobs.size() == baseline).await;
    assert_eq!(handler.calls(), 0);
    assert_eq!(logs.matching(Level::ERROR, "unknown message type").len(), 1);

    assert_eq!(running.shutdown().await, DrainOutcome::Clean);
    assert_eq!(logs.count(Level::ERROR), 1);
}

#[tokio::test]
async fn startup_events_share_one_correlation_id() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let transport = MemoryTransport::new(&["listen-topic"]);
    let mut adapter = transport.adapter(test_context());
    adapter
        .subscribe("ping", Arc::new(Recording::default()))
        .unwrap();
    transport.claim_all();
    let running = adapter.start().await.unwrap();

    let ids: Vec<String> = [
        "subscribed handler for ping",
        "starting with 1 handlers",
        "rebalance ok, claimed",
    ]
    .iter()
    .map(|needle| {
        let events = logs.matching(Level::INFO, needle);
        assert_eq!(events.len(), 1, "expected one event for {needle}");
        events[0].fields["correlation_id"].clone()
    })
    .collect();
    assert!(!ids[0].is_empty());
    assert!(ids.iter().all(|id| *id == ids[0]));

    assert_eq!(running.shutdown().await, DrainOutcome::Clean);
}

#[tokio::test]
async fn start_without_handlers_warns() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let transport = MemoryTransport::new(&["listen-topic"]);
    let adapter = transport.adapter(test_context());
    transport.claim_all();
    let running = adapter.start().await.unwrap();

    assert_eq!(
        logs.matching(Level::WARN, "starting without handlers").len(),
        1
    );
    assert_eq!(running.shutdown().await, DrainOutcome::Clean);
}

#[tokio::test]
async fn undecodable_record_is_skipped() {
    let transport = MemoryTransport::new(&["listen-topic"]);
    let mut adapter = transport.adapter(test_context());
    let handler = Arc::new(Recording::default());
    adapter.subscribe("ping", handler.clone()).unwrap();
    let jobs = adapter.jobs();

    transport.claim_all();
    let running = adapter.start().await.unwrap();

    let mut broken = typed_record("ping");
    broken.headers.retain(|header| header.key != TYPE_HEADER);
    transport.publish(broken);
    transport.publish(typed_record("ping"));

    // The bad record does not stop the stream
    assert_or_retry(|| handler.calls() == 1).await;
    assert_or_retry(|| jobs.is_empty()).await;
    assert_eq!(transport.marked_offsets().len(), 2);

    assert_eq!(running.shutdown().await, DrainOutcome::Clean);
}

#[tokio::test(start_paused = true)]
async fn start_fails_without_a_claim() {
    let transport = MemoryTransport::new(&["listen-topic", "other-topic"]);
    let adapter = transport.adapter(test_context());

    // Only one of the two topics is ever claimed
    transport.notify(RebalanceNotification::Assigned(vec![Partition::new(
        "listen-topic",
        0,
    )]));

    let err = adapter.start().await.err().unwrap();
    assert!(matches!(
        err,
        AdapterError::ClaimTimeout { timeout, .. } if timeout == Duration::from_secs(60)
    ));
    assert!(transport.is_closed());
}

#[tokio::test]
async fn health_follows_rebalances_and_connectivity_errors() {
    let transport = MemoryTransport::new(&["listen-topic"]);
    let monitor = transport.start_health();
    let adapter = transport.adapter(test_context());
    assert!(!monitor.is_healthy());

    transport.claim_all();
    let running = adapter.start().await.unwrap();
    assert_or_retry(|| monitor.is_healthy()).await;

    transport.fail_consumer("read tcp 10.0.0.1:9092: i/o timeout");
    assert_or_retry(|| monitor.entity_status("consumer") == Some(EntityStatus::Down)).await;
    assert_or_retry(|| !monitor.is_healthy()).await;

    transport.notify(RebalanceNotification::Assigned(vec![Partition::new(
        "listen-topic",
        2,
    )]));
    assert_or_retry(|| monitor.is_healthy()).await;

    transport.fail_consumer("kafka: broker unreachable");
    assert_or_retry(|| monitor.entity_status("consumer") == Some(EntityStatus::Down)).await;
    transport.claim_all();
    assert_or_retry(|| monitor.is_healthy()).await;

    // Anything that is not a connectivity loss leaves health alone
    transport.fail_consumer("Broker: Unknown topic or partition");
    transport.fail_producer("Local: Invalid argument or configuration");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(monitor.is_healthy());

    transport.fail_producer("kafka: client has run out of available brokers to talk to");
    assert_or_retry(|| monitor.entity_status("producer") == Some(EntityStatus::Down)).await;
    transport.deliver("send-topic");
    assert_or_retry(|| monitor.entity_status("producer") == Some(EntityStatus::Up)).await;

    assert_eq!(running.shutdown().await, DrainOutcome::Clean);
    monitor.stop();
}

#[tokio::test]
async fn send_stamps_headers_and_reports_local_failures() {
    let env = HashMap::from([
        ("KAFKA_PRODUCER_TOPIC".to_string(), "replies".to_string()),
        ("PROGRAM_TAG".to_string(), "tagged".to_string()),
    ]);
    let context = AppContext::new(Config::init_from_hashmap(&env).unwrap());
    let transport = MemoryTransport::new(&["listen-topic"]);
    let adapter = transport.adapter(context);
    let publisher = adapter.publisher();

    let reply_to = Uuid::now_v7();
    let first = publisher
        .send(OutboundMessage::new("pong").in_reply_to(reply_to))
        .unwrap();
    let second = publisher.send(OutboundMessage::new("pong")).unwrap();
    assert_ne!(first, second);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].topic, "replies");
    assert_eq!(sent[0].header("Message-ID"), Some(first.as_bytes().as_slice()));
    assert_eq!(sent[0].header("To"), Some("replies".as_bytes()));
    assert_eq!(
        sent[0].header(IN_REPLY_TO_HEADER),
        Some(reply_to.as_bytes().as_slice())
    );
    assert_eq!(sent[0].header("Some-about-program"), Some("tagged".as_bytes()));
    assert_eq!(sent[1].header(IN_REPLY_TO_HEADER), None);

    transport.reject_sends(true);
    assert!(matches!(
        publisher.send(OutboundMessage::new("pong")),
        Err(TransportError::Rejected(_))
    ));
    assert_eq!(transport.sent().len(), 2);
}
