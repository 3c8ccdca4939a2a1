//! Two-state health relay for the components of the service.
//!
//! Every monitored entity is either up or down. Components never touch the
//! state directly: they hold a [`HealthSignal`] and fire `up()` / `down()`
//! into two single-slot channels. A task owned by the relay drains those
//! channels, flips the entity state and pulses a shared "state changed"
//! channel. A second task reacts to the pulses by summing all entity states:
//!   - if every entity is up, the process is healthy ("health good")
//!   - if any entity is down, the process is unhealthy ("health bad")
//!
//! Entities start down and must fire `up()` at least once. The relay is
//! observability only, nothing gates traffic on it.
//!
//! Registration happens before [`HealthRelay::start`]; the running
//! [`HealthMonitor`] has a fixed set of entities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const RELAY_ENTITY: &str = "health";

const STATE_DOWN: u8 = 0;
const STATE_UP: u8 = 1;

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all entities are up
    pub healthy: bool,
    /// Current status of each registered entity, for display
    pub components: HashMap<String, EntityStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each entity status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntityStatus {
    Up,
    Down,
}

impl From<u8> for EntityStatus {
    fn from(state: u8) -> Self {
        match state {
            STATE_UP => EntityStatus::Up,
            _ => EntityStatus::Down,
        }
    }
}

/// Sending half of an entity's up/down channels.
///
/// Both channels hold at most one pending signal. Firing a signal while one
/// of the same kind is already pending is a no-op, so callers never block.
#[derive(Clone, Debug)]
pub struct HealthSignal {
    entity: String,
    up: mpsc::Sender<()>,
    down: mpsc::Sender<()>,
}

impl HealthSignal {
    pub fn up(&self) {
        fire(&self.up, &self.entity, "up");
    }

    pub fn down(&self) {
        fire(&self.down, &self.entity, "down");
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

fn fire(slot: &mpsc::Sender<()>, entity: &str, kind: &str) {
    match slot.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) => {}
        Err(TrySendError::Closed(())) => {
            debug!(
                entity = RELAY_ENTITY,
                monitored = entity,
                "dropped {kind} signal, relay stopped"
            );
        }
    }
}

struct EntityCell {
    entity: String,
    state: Arc<Mutex<u8>>,
}

impl EntityCell {
    fn load(&self) -> u8 {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Registration {
    cell: EntityCell,
    metric: String,
    up_rx: mpsc::Receiver<()>,
    down_rx: mpsc::Receiver<()>,
}

pub struct HealthRelay {
    name: String,
    correlation_id: String,
    aggregate_interval: Duration,
    registrations: Vec<Registration>,
}

impl HealthRelay {
    /// `name` prefixes the aggregate metrics, `aggregate_interval` paces the
    /// aggregate snapshots.
    pub fn new(name: &str, correlation_id: &str, aggregate_interval: Duration) -> Self {
        Self {
            name: name.to_owned(),
            correlation_id: correlation_id.to_owned(),
            aggregate_interval,
            registrations: Vec::new(),
        }
    }

    /// Registers a new entity, exported as the gauge `metric{module=entity}`.
    /// The returned signal should be passed to whatever observes that entity.
    pub fn register(&mut self, entity: &str, metric: &str) -> HealthSignal {
        let (up, up_rx) = mpsc::channel(1);
        let (down, down_rx) = mpsc::channel(1);

        metrics::gauge!(metric.to_owned(), "module" => entity.to_owned()).set(0.0);
        debug!(
            entity = RELAY_ENTITY,
            correlation_id = %self.correlation_id,
            "add new health metric: {entity}"
        );

        self.registrations.push(Registration {
            cell: EntityCell {
                entity: entity.to_owned(),
                state: Arc::new(Mutex::new(STATE_DOWN)),
            },
            metric: metric.to_owned(),
            up_rx,
            down_rx,
        });

        HealthSignal {
            entity: entity.to_owned(),
            up,
            down,
        }
    }

    /// Spawns one task per entity and the aggregation task.
    pub fn start(self) -> HealthMonitor {
        let (pulse_tx, pulse_rx) = mpsc::channel::<()>(1);
        let healthy = Arc::new(AtomicBool::new(false));
        let mut cells = Vec::with_capacity(self.registrations.len());
        let mut tasks = Vec::with_capacity(self.registrations.len() + 1);

        for registration in self.registrations {
            cells.push(EntityCell {
                entity: registration.cell.entity.clone(),
                state: registration.cell.state.clone(),
            });
            tasks.push(tokio::spawn(watch_entity(
                registration,
                pulse_tx.clone(),
                self.correlation_id.clone(),
            )));
        }
        drop(pulse_tx);

        let cells = Arc::new(cells);
        tasks.push(tokio::spawn(aggregate(
            self.name.clone(),
            self.correlation_id.clone(),
            self.aggregate_interval,
            cells.clone(),
            healthy.clone(),
            pulse_rx,
        )));

        HealthMonitor {
            name: self.name,
            cells,
            healthy,
            tasks,
        }
    }
}

async fn watch_entity(
    mut registration: Registration,
    pulse: mpsc::Sender<()>,
    correlation_id: String,
) {
    loop {
        let next = tokio::select! {
            Some(()) = registration.down_rx.recv() => STATE_DOWN,
            Some(()) = registration.up_rx.recv() => STATE_UP,
            else => break,
        };

        {
            let mut state = registration
                .cell
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *state = next;
            metrics::gauge!(
                registration.metric.clone(),
                "module" => registration.cell.entity.clone()
            )
            .set(f64::from(next));
        }

        info!(
            entity = RELAY_ENTITY,
            correlation_id = %correlation_id,
            "{} is {}",
            registration.cell.entity,
            if next == STATE_UP { "UP" } else { "DOWN" }
        );

        // A pending pulse already makes the aggregator re-read every state.
        if let Err(TrySendError::Closed(())) = pulse.try_send(()) {
            break;
        }
    }
}

async fn aggregate(
    name: String,
    correlation_id: String,
    interval: Duration,
    cells: Arc<Vec<EntityCell>>,
    healthy: Arc<AtomicBool>,
    mut pulses: mpsc::Receiver<()>,
) {
    let gauge_name = format!("{name}_health");
    let histogram_name = format!("{name}_histogram_health");

    while pulses.recv().await.is_some() {
        let total: usize = cells.iter().map(|cell| usize::from(cell.load())).sum();
        let good = total == cells.len();
        healthy.store(good, Ordering::SeqCst);

        let value = if good { 1.0 } else { 0.0 };
        metrics::gauge!(gauge_name.clone(), "module" => "total").set(value);
        metrics::histogram!(histogram_name.clone()).record(value);

        if good {
            info!(entity = RELAY_ENTITY, correlation_id = %correlation_id, "health good");
        } else {
            info!(entity = RELAY_ENTITY, correlation_id = %correlation_id, "health bad");
        }

        tokio::time::sleep(interval).await;
    }
}

/// Read side of a started relay.
pub struct HealthMonitor {
    name: String,
    cells: Arc<Vec<EntityCell>>,
    healthy: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    /// The last aggregate computed by the relay. False until the first
    /// snapshot.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn entity_status(&self, entity: &str) -> Option<EntityStatus> {
        self.cells
            .iter()
            .find(|cell| cell.entity == entity)
            .map(|cell| EntityStatus::from(cell.load()))
    }

    /// Returns the overall status along with every entity's. Can be used as
    /// an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .cells
            .iter()
            .map(|cell| (cell.entity.clone(), EntityStatus::from(cell.load())))
            .collect();
        let status = HealthStatus {
            healthy: self.is_healthy(),
            components,
        };
        debug!(entity = RELAY_ENTITY, "{} health status: {:?}", self.name, status);
        status
    }

    /// Stops the relay tasks. Signals fired afterwards are dropped.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc() + time::Duration::seconds(5);
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check())
    }

    fn relay() -> HealthRelay {
        HealthRelay::new("test", "00000000-0000-0000-0000-000000000000", Duration::from_millis(5))
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let mut relay = relay();
        relay.register("one", "test_one_health");
        let monitor = relay.start();

        assert!(!monitor.is_healthy());
        assert_eq!(monitor.entity_status("one"), Some(EntityStatus::Down));
        assert_eq!(monitor.entity_status("missing"), None);
    }

    #[tokio::test]
    async fn one_entity() {
        let mut relay = relay();
        let signal = relay.register("one", "test_one_health");
        let monitor = relay.start();

        signal.up();
        assert_or_retry(|| monitor.is_healthy()).await;
        assert_eq!(monitor.entity_status("one"), Some(EntityStatus::Up));

        signal.down();
        assert_or_retry(|| !monitor.is_healthy()).await;
        let status = monitor.get_status();
        assert_eq!(status.components.get("one"), Some(&EntityStatus::Down));
    }

    #[tokio::test]
    async fn several_entities() {
        let mut relay = relay();
        let one = relay.register("one", "test_one_health");
        let two = relay.register("two", "test_two_health");
        let monitor = relay.start();

        // First entity going up is not enough
        one.up();
        assert_or_retry(|| monitor.entity_status("one") == Some(EntityStatus::Up)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_healthy());

        // Second entity going up brings the health to green
        two.up();
        assert_or_retry(|| monitor.is_healthy()).await;

        // Any entity going down takes the health to red
        one.down();
        assert_or_retry(|| !monitor.is_healthy()).await;

        one.up();
        assert_or_retry(|| monitor.is_healthy()).await;
    }

    #[tokio::test]
    async fn repeated_signals_never_block() {
        let mut relay = relay();
        let signal = relay.register("one", "test_one_health");

        // Nothing drains the slot before start: extra signals are dropped
        for _ in 0..10 {
            signal.up();
        }

        let monitor = relay.start();
        assert_or_retry(|| monitor.entity_status("one") == Some(EntityStatus::Up)).await;
    }

    #[tokio::test]
    async fn signals_after_stop_are_dropped() {
        let mut relay = relay();
        let signal = relay.register("one", "test_one_health");
        let monitor = relay.start();
        monitor.stop();

        tokio::task::yield_now().await;
        signal.up();
        signal.down();
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
