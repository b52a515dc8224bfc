// HTTP handlers for the query API. These are thin wrappers around the
// shared MongoDB handle and the Prometheus `Registry`; the date path
// segment is validated because collection names are built from it.
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::Json;
use futures::TryStreamExt;
use mongodb::bson::{Document, doc};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tracing::warn;

use crate::ingest;
use crate::server::AppState;

/// Return every document stored for the given day, newest first. A day
/// with no collection yields an empty array rather than an error.
pub async fn sensor_data_by_date(
    Path(date): Path<String>,
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<Document>>, (StatusCode, String)> {
    if !ingest::is_valid_date_segment(&date) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("date must be formatted dd_mm_yy, got {date:?}"),
        ));
    }

    let name = ingest::collection_name_for_segment(&state.collection_prefix, &date);

    let existing = state
        .db
        .list_collection_names()
        .filter(doc! { "name": &name })
        .await
        .map_err(internal_error)?;
    if existing.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let cursor = state
        .db
        .collection::<Document>(&name)
        .find(doc! {})
        .sort(doc! { "timestamp": -1 })
        .await
        .map_err(internal_error)?;
    let documents: Vec<Document> = cursor.try_collect().await.map_err(internal_error)?;

    Ok(Json(documents))
}

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

pub async fn health_handler() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// Expose Prometheus text-format metrics gathered from the shared
/// `Registry` extension.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> (HeaderMap, String) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (headers, String::from_utf8_lossy(&buffer).to_string())
}

fn internal_error(err: mongodb::error::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health_handler().await;
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn metrics_encode_registered_counters() {
        let registry = Arc::new(Registry::new());
        let counter =
            prometheus::IntCounter::new("bridge_test_total", "test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let (headers, body) = metrics_handler(Extension(registry)).await;
        assert_eq!(headers[CONTENT_TYPE], "text/plain; version=0.0.4");
        assert!(body.contains("bridge_test_total 1"));
    }
}
