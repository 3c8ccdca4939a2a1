use std::sync::Arc;

use anyhow::{Context, Result};
use bus_adapter::config::{Config, LogFormat};
use bus_adapter::context::AppContext;
use bus_adapter::facade::PortAdapter;
use bus_adapter::handlers::register_default_handlers;
use bus_adapter::server;
use bus_adapter::shutdown::DrainOutcome;
use envconfig::Envconfig;
use health::HealthRelay;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let log_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Default => fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    init_tracing(config.log_format);

    let context = AppContext::new(config);
    let startup_id = context.ids.new_job_id();
    info!(
        entity = "program",
        correlation_id = %startup_id,
        "starting bus adapter, consuming {:?}, producing to {}",
        context.config.listen_topics(),
        context.config.kafka_producer_topic
    );

    let mut relay = HealthRelay::new(
        "bus_adapter",
        &startup_id,
        context.config.health_aggregate_interval.0,
    );
    let consumer_health = relay.register("consumer", "bus_adapter_consumer_health");
    let producer_health = relay.register("producer", "bus_adapter_producer_health");
    let monitor = Arc::new(relay.start());

    let recorder = server::setup_metrics_recorder().context("failed to install metrics recorder")?;
    let listener = server::bind(&context.config.bind())
        .await
        .context("monitoring endpoint is not available")?;
    let stop_server = CancellationToken::new();
    let server_handle = server::serve(
        listener,
        server::router(monitor.clone(), Some(recorder)),
        stop_server.clone(),
    );

    let mut adapter = PortAdapter::connect(context.clone(), consumer_health, producer_health)
        .await
        .context("failed to connect to kafka")?;
    register_default_handlers(&mut adapter).context("failed to register handlers")?;
    let running = adapter
        .start()
        .await
        .context("failed to join consumer group")?;

    let shutdown = CancellationToken::new();
    let done = running.spawn_watcher(shutdown.clone());

    shutdown_signal().await;
    shutdown.cancel();

    match done.await.context("drain task went away")? {
        DrainOutcome::Clean => {
            info!(entity = "program", correlation_id = %startup_id, "drain complete")
        }
        DrainOutcome::TimedOut { abandoned } => warn!(
            entity = "program",
            correlation_id = %startup_id,
            "drain timed out with {} jobs outstanding",
            abandoned.len()
        ),
    }

    monitor.stop();
    stop_server.cancel();
    if let Err(e) = server_handle.await {
        warn!("monitoring server task failed: {}", e);
    }

    info!(entity = "program", correlation_id = %startup_id, "program stopped");
    Ok(())
}
