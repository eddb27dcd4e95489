//! # Health & Metrics Endpoints
//!
//! Small HTTP surface started by `killfeed run --metrics-port`.
//!
//! | Endpoint | Purpose | K8s Probe |
//! |----------|---------|-----------|
//! | `GET /healthz` | Liveness: process is alive, lists configured streams | `livenessProbe` |
//! | `GET /readyz` | Readiness: store reachable and no stalled stream | `readinessProbe` |
//! | `GET /metrics` | Prometheus scraping endpoint | `ServiceMonitor` |
//!
//! A stream is stalled after [`STALL_AFTER_FAILURES`] failed cycles in a row
//! (wrong credentials, a dead file server). `/readyz` answers 503 with the
//! per-stream status so the failing stream is visible from the probe output.

use crate::prom_metrics::Metrics;
use crate::store::EventStore;
use crate::worker::{Liveness, STALL_AFTER_FAILURES};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const STORE_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub metrics: Arc<Metrics>,
    pub liveness: Arc<Liveness>,
}

pub async fn handler_healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams: Vec<String> = state.liveness.snapshot().into_keys().collect();
    Json(json!({ "status": "ok", "streams": streams }))
}

pub async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = match tokio::time::timeout(STORE_CHECK_TIMEOUT, state.store.health_check()).await
    {
        Ok(Ok(())) => "ok".to_string(),
        Ok(Err(e)) => format!("unreachable: {}", e),
        Err(_) => "timeout".to_string(),
    };
    let stalled = state.liveness.stalled();
    let ready = store == "ok" && stalled.is_empty();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "ready": ready,
        "store": store,
        "stalled": stalled,
        "streams": state.liveness.snapshot(),
    });
    (status, Json(body))
}

pub async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.encode(),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handler_healthz))
        .route("/readyz", get(handler_readyz))
        .route("/metrics", get(handler_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ))
        .with_state(state)
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "metrics server running");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("metrics server stopped");
    Ok(())
}

/// Flip `stop` to `true` on the first SIGINT or SIGTERM.
///
/// Workers notice the flag between cycles, so a cycle in flight still
/// finishes its commit before the process exits.
pub async fn forward_shutdown(stop: watch::Sender<bool>) {
    let signal = next_signal().await;
    info!(signal, "shutdown requested, finishing in-flight cycles");
    let _ = stop.send(true);
}

#[cfg(unix)]
async fn next_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = interrupt() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, only SIGINT stops the pipeline");
            interrupt().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn next_signal() -> &'static str {
    interrupt().await;
    "SIGINT"
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "SIGINT handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn state() -> Arc<AppState> {
        let store = SqliteStore::in_memory().await.unwrap();
        let liveness = Arc::new(Liveness::default());
        liveness.register("adm");
        Arc::new(AppState {
            store: Arc::new(store),
            metrics: Arc::new(Metrics::new()),
            liveness,
        })
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn json_of(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn healthz_lists_streams() {
        let (status, body) = get_body(router(state().await), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body), json!({ "status": "ok", "streams": ["adm"] }));
    }

    #[tokio::test]
    async fn readyz_ok_with_healthy_store_and_streams() {
        let state = state().await;
        state.liveness.record_ok("adm", Utc::now());
        let (status, body) = get_body(router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_of(&body);
        assert_eq!(body["ready"], true);
        assert_eq!(body["store"], "ok");
    }

    #[tokio::test]
    async fn readyz_fails_when_a_stream_stalls() {
        let state = state().await;
        for _ in 0..STALL_AFTER_FAILURES {
            state.liveness.record_failure("adm", "fetch failed: auth failure");
        }
        let (status, body) = get_body(router(Arc::clone(&state)), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body = json_of(&body);
        assert_eq!(body["stalled"], json!(["adm"]));
        assert_eq!(body["streams"]["adm"]["last_error"], "fetch failed: auth failure");

        state.liveness.record_ok("adm", Utc::now());
        let (status, _) = get_body(router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_registry() {
        let state = state().await;
        Metrics::stream(&state.metrics.events_committed, "adm").inc_by(3);
        let (status, body) = get_body(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("killfeed_events_committed_total{stream=\"adm\"} 3"));
    }

    #[tokio::test]
    async fn forward_shutdown_is_idle_until_a_signal() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(forward_shutdown(tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!*rx.borrow());
        task.abort();
    }
}
