// `server.rs` composes the service: it loads configuration, connects to
// MongoDB, registers Prometheus metrics, starts the store writer and the
// MQTT background task, and mounts HTTP handlers and middleware.
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Extension, Router};
use mongodb::bson::doc;
use mongodb::Client;
use prometheus::{IntCounter, Registry};
use tokio::sync::{mpsc, watch};
use tokio::task;
use tokio::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::ingest::IngestRecord;
use crate::{handlers, mqtt, store};

/// Queue between the MQTT loop and the store writer. When the writer lags,
/// a full queue parks the MQTT event loop, and backpressure propagates to
/// the broker through unacked QoS 1 deliveries.
const RECORD_QUEUE_CAPACITY: usize = 1024;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: mongodb::Database,
    pub collection_prefix: String,
}

pub async fn run() -> anyhow::Result<()> {
    // Load `.env` before anything reads the environment.
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    let mongo = Client::with_uri_str(&config.mongo.uri).await?;
    let db = mongo.database(&config.mongo.database);
    // Fail fast if the database is unreachable.
    db.run_command(doc! { "ping": 1 }).await?;
    info!(database = %config.mongo.database, "connected to MongoDB");

    let registry = Arc::new(Registry::new());
    let mqtt_counters = mqtt::MqttCounters {
        received: register_counter(
            &registry,
            "mqtt_messages_received_total",
            "MQTT messages received",
        )?,
        rejected: register_counter(
            &registry,
            "mqtt_messages_rejected_total",
            "MQTT messages rejected as malformed",
        )?,
    };
    let store_counters = store::StoreCounters {
        stored: register_counter(&registry, "documents_stored_total", "Documents inserted")?,
        duplicates: register_counter(
            &registry,
            "documents_duplicate_total",
            "Documents skipped as redelivered duplicates",
        )?,
        retries: register_counter(
            &registry,
            "store_insert_retries_total",
            "Insert attempts retried after a transient failure",
        )?,
        dropped: register_counter(
            &registry,
            "documents_dropped_total",
            "Documents dropped after exhausting the retry budget",
        )?,
    };

    let (record_tx, record_rx) = mpsc::channel::<IngestRecord>(RECORD_QUEUE_CAPACITY);
    task::spawn(store::run_writer(db.clone(), record_rx, store_counters));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mqtt_config = config.mqtt.clone();
    let collection_prefix = config.mongo.collection_prefix.clone();
    let mqtt_task = task::spawn(async move {
        if let Err(e) = mqtt::start_mqtt_loop(
            mqtt_config,
            collection_prefix,
            record_tx,
            mqtt_counters,
            shutdown_rx,
        )
        .await
        {
            error!(error = %e, "MQTT task ended");
        }
    });

    let cors_origin = config
        .http
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| anyhow::anyhow!("invalid CORS_ALLOWED_ORIGIN: {e}"))?;
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_methods([Method::GET]);

    let state = AppState {
        db,
        collection_prefix: config.mongo.collection_prefix.clone(),
    };

    let app = Router::new()
        .route("/api/sensor/{date}", get(handlers::sensor_data_by_date))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health_handler))
        .layer(Extension(state))
        .layer(Extension(registry))
        .layer(cors);

    info!(addr = %config.http.bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let the MQTT task send its DISCONNECT before the process exits.
    shutdown_tx.send(true).ok();
    if tokio::time::timeout(Duration::from_secs(5), mqtt_task)
        .await
        .is_err()
    {
        warn!("MQTT task did not shut down within 5s");
    }
    info!("shutdown complete");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn register_counter(registry: &Registry, name: &str, help: &str) -> anyhow::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
}
