//! DeliveryGo service binary.
//!
//! ```bash
//! # Consume intents and serve health endpoints
//! deliverygo
//!
//! # Re-fold projections from the event log, then exit
//! deliverygo rebuild D1 D2
//! ```

use anyhow::{Context, bail};
use deliverygo::config::Config;
use deliverygo::http::{AppState, router};
use deliverygo::telemetry;
use deliverygo_core::environment::SystemClock;
use deliverygo_core::event_store::EventStoreError;
use deliverygo_core::stream::DeliveryId;
use deliverygo_postgres::PostgresDeliveryEventStore;
use deliverygo_projections::{PostgresDeliveryProjectionStore, ProjectionBuilder};
use deliverygo_redpanda::{RedpandaConsumer, RedpandaPublisher};
use deliverygo_runtime::metrics::MetricsServer;
use deliverygo_runtime::retry::retry_with_predicate;
use deliverygo_runtime::{ConsumerSupervisor, HealthState, IngestionPipeline, IntentHandler};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    telemetry::init(config.server.log_format);

    let args: Vec<String> = std::env::args().skip(1).collect();

    tracing::info!(
        brokers = %config.redpanda.brokers,
        notification_topic = %config.redpanda.notification_topic,
        "Configuration loaded"
    );

    let events = connect_event_store(&config).await?;
    events.migrate().await.context("event store migration")?;

    let projection_store = if config.projection_database_url == config.database.url {
        PostgresDeliveryProjectionStore::new(events.pool().clone())
    } else {
        PostgresDeliveryProjectionStore::new_with_separate_db(
            &config.projection_database_url,
            config.database.max_connections,
            config.database.connect_timeout,
        )
        .await
        .context("projection database")?
    };
    let projection_store = projection_store.with_operation_timeout(config.database.operation_timeout);
    projection_store.migrate().await.context("projection migration")?;

    let builder = ProjectionBuilder::new(Arc::new(events.clone()), Arc::new(projection_store));

    match args.first().map(String::as_str) {
        None => run(config, events, builder).await,
        Some("rebuild") => rebuild(&builder, &args[1..]).await,
        Some(other) => bail!("Unknown command '{other}'. Usage: deliverygo [rebuild <deliveryId>...]"),
    }
}

async fn connect_event_store(config: &Config) -> anyhow::Result<PostgresDeliveryEventStore> {
    let db = &config.database;
    let store = retry_with_predicate(
        &config.consumer_policy(),
        || PostgresDeliveryEventStore::connect(&db.url, db.max_connections, db.connect_timeout),
        EventStoreError::is_retryable,
    )
    .await
    .context("event store database")?;
    Ok(store.with_operation_timeout(db.operation_timeout))
}

async fn rebuild(builder: &ProjectionBuilder, ids: &[String]) -> anyhow::Result<()> {
    if ids.is_empty() {
        bail!("Usage: deliverygo rebuild <deliveryId>...");
    }

    let ids = ids
        .iter()
        .map(|id| id.parse::<DeliveryId>())
        .collect::<Result<Vec<_>, _>>()?;

    for projection in builder.rebuild_all(&ids).await? {
        tracing::info!(
            delivery_id = %projection.delivery_id,
            status = %projection.status,
            last_sequence = projection.last_sequence,
            "Projection rebuilt"
        );
    }
    Ok(())
}

async fn run(
    config: Config,
    events: PostgresDeliveryEventStore,
    builder: ProjectionBuilder,
) -> anyhow::Result<()> {
    let mut metrics = MetricsServer::new();
    if config.server.metrics_enabled {
        metrics.start()?;
    }

    let redpanda = &config.redpanda;
    let publisher = RedpandaPublisher::builder()
        .brokers(&redpanda.brokers)
        .topic(&redpanda.notification_topic)
        .build()?;

    let routes = config.routes();
    let mut consumer = RedpandaConsumer::builder()
        .brokers(&redpanda.brokers)
        .topics(routes.topics())
        .retry_delay(redpanda.retry_delay);
    if let Some(group) = &redpanda.consumer_group {
        consumer = consumer.consumer_group(group);
    }
    let consumer = consumer.build()?;

    let pipeline = IngestionPipeline::new(
        Arc::new(events.clone()),
        builder,
        Arc::new(publisher),
        Arc::new(SystemClock),
    );

    let health = HealthState::new();
    let supervisor = ConsumerSupervisor::new(
        Arc::new(consumer),
        Arc::new(IntentHandler::new(pipeline, routes)),
        config.consumer_policy(),
        health.clone(),
    );
    let consumer_task = tokio::spawn(async move {
        match supervisor.run().await {
            Ok(()) => tracing::info!("Consumer stopped"),
            Err(e) => tracing::error!(error = %e, "Consumer gave up; service is no longer ready"),
        }
    });

    let addr = config.server.addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "HTTP server listening");

    let app = router(AppState {
        health,
        events: Arc::new(events),
        metrics: Arc::new(metrics),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down");
    consumer_task.abort();
    Ok(())
}
