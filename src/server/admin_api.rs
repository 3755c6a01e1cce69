//! HTTP admin API over a string-keyed tiered store.
//!
//! - GET /health
//! - GET /v1/store/stats
//! - GET, PUT, DELETE /v1/entries/{key}
//! - GET /metrics
//!
//! Store calls are synchronous and bounded by engine I/O; handlers call the
//! store directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::StoreError;
use crate::metrics::PrometheusEvents;
use crate::store::entry::{CacheVersion, SwapValue};
use crate::store::tiered::{StoreStats, TieredStore};

/// Application state shared across handlers.
pub struct AppState {
    pub store: Arc<TieredStore<String, String>>,
    pub metrics: Arc<PrometheusEvents>,
    pub node_order: u32,
    pub start_time: Instant,
    next_order: AtomicU64,
}

impl AppState {
    pub fn new(store: Arc<TieredStore<String, String>>, metrics: Arc<PrometheusEvents>) -> Self {
        Self {
            store,
            metrics,
            node_order: 0,
            start_time: Instant::now(),
            next_order: AtomicU64::new(1),
        }
    }

    fn next_version(&self) -> CacheVersion {
        CacheVersion::new(1, self.next_order.fetch_add(1, Ordering::Relaxed), self.node_order)
    }
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/store/stats", get(store_stats))
        .route(
            "/v1/entries/{key}",
            get(get_entry).put(put_entry).delete(delete_entry),
        )
        .route("/metrics", get(metrics))
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub store: StoreStats,
}

#[derive(Debug, Deserialize)]
pub struct PutEntryRequest {
    pub value: String,
    /// Time to live in milliseconds (0 = eternal).
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryResponse {
    pub key: String,
    pub value: String,
    pub version: CacheVersion,
    pub ttl: u64,
    pub expire_time: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Store failure surfaced as a 500.
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Store operation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        store: state.store.stats()?,
    }))
}

async fn store_stats(State(state): State<Arc<AppState>>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(state.store.stats()?))
}

async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.read_key(&key)? {
        Some(entry) => {
            let value = match entry.value {
                SwapValue::Object(v) => v,
                SwapValue::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
            };
            Ok(Json(EntryResponse {
                key,
                value,
                version: entry.envelope.version,
                ttl: entry.envelope.ttl,
                expire_time: entry.envelope.expire_time,
            })
            .into_response())
        }
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

async fn put_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<PutEntryRequest>,
) -> Result<StatusCode, ApiError> {
    let store = &state.store;
    let codec = store.codec();

    let key_bytes = codec.marshal_key(&key).map_err(StoreError::from)?;
    let expire_time = if req.ttl > 0 { now_millis() + req.ttl } else { 0 };
    let envelope = codec
        .envelope_for(&key_bytes, &req.value, state.next_version())
        .map_err(StoreError::from)?
        .with_ttl(req.ttl, expire_time);

    store.write(&key, key_bytes, &envelope)?;

    info!(key = %key, ttl = req.ttl, "Entry written");
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.store.read_and_remove_key(&key)? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Ok(StatusCode::NOT_FOUND),
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state.metrics.observe(&state.store.stats()?);

    match state.metrics.render() {
        Ok(body) => Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvictionConfig, StoreConfig};
    use crate::context::StoreContext;
    use crate::engine::region::MemoryRegion;
    use crate::engine::swap_file::FileSwapSpace;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(tmp: &TempDir) -> Router {
        let metrics = Arc::new(PrometheusEvents::new().unwrap());
        let ctx = StoreContext::standalone(4).with_events(metrics.clone());
        let store = TieredStore::start(
            &StoreConfig::default(),
            true,
            ctx,
            Arc::new(MemoryRegion::new(EvictionConfig::default())),
            Arc::new(FileSwapSpace::new(tmp.path(), None).unwrap()),
        )
        .unwrap();
        build_router(Arc::new(AppState::new(Arc::new(store), metrics)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_entry_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);

        let (status, _) = send(&app, "GET", "/v1/entries/k1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "PUT", "/v1/entries/k1", Some(r#"{"value":"v1"}"#)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", "/v1/entries/k1", None).await;
        assert_eq!(status, StatusCode::OK);
        let entry: EntryResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(entry.value, "v1");

        let (status, _) = send(&app, "DELETE", "/v1/entries/k1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/v1/entries/k1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        send(&app, "PUT", "/v1/entries/a", Some(r#"{"value":"x","ttl":1000}"#)).await;

        let (status, body) = send(&app, "GET", "/v1/store/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["selection"], "both");
        assert_eq!(stats["off_heap_entries"], 1);

        let (status, body) = send(&app, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("tiered_swap_transitions_total{kind=\"to_offheap\"} 1"));
        assert!(text.contains("tiered_swap_offheap_entries 1"));
    }
}
