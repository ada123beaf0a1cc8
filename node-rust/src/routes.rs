use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{Local, Utc};
use serde_json::json;
use std::sync::Arc;

use gridbug_protocol::{IngressError, ReloadError};

use crate::models::*;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/post", post(post_gossip))
        .route("/bugs", get(bugs))
        .route("/gridbugs.json", get(bugs))
        .route("/ping", get(ping))
        .route("/graph", get(graph))
        .route("/raw", get(raw))
        .route("/stats", get(stats))
        .route("/clear", get(clear))
        .route("/time", get(time))
        .fallback(unsupported)
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Count every request; per-path hits only for the ones that succeeded.
async fn track_requests(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let metrics = &state.node.metrics;
    let path = request.uri().path().to_string();
    if request.method() == Method::POST {
        metrics.record_post();
    } else {
        metrics.record_get();
    }

    let response = next.run(request).await;
    let failed = response.extensions().get::<RequestFailed>().is_some();
    if response.status().is_success() && !failed {
        metrics.record_hit(&path).await;
    } else {
        metrics.record_error();
        tracing::debug!(path = %path, status = %response.status(), "Request failed");
    }
    response
}

fn ingress_response(err: IngressError) -> Response {
    match err {
        // Look like an accepted push so probes learn nothing about the key
        IngressError::Unauthorized => {
            (Extension(RequestFailed), Json(json!({ "status": "OK" }))).into_response()
        }
        IngressError::PayloadTooLarge { .. } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "status": "error", "error": "payload too large" })),
        )
            .into_response(),
        IngressError::Busy => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "busy" }))).into_response()
        }
        IngressError::Merge(_) => (
            Extension(RequestFailed),
            Json(json!({ "status": "error", "error": "invalid payload" })),
        )
            .into_response(),
    }
}

async fn post_gossip(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Body) -> Response {
    let node = &state.node;

    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(size) = declared {
        if let Err(e) = node.check_size(size) {
            return ingress_response(e);
        }
    }

    let key = headers.get("key").and_then(|v| v.to_str().ok());
    if let Err(e) = node.authorize(key) {
        return ingress_response(e);
    }

    let max = node.settings.max_payload_bytes;
    let bytes = match axum::body::to_bytes(body, max).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // limit hit on a body without (or with a lying) Content-Length
            tracing::warn!(max, error = %e, "Gossip body exceeded limit");
            return ingress_response(IngressError::PayloadTooLarge { size: max + 1, max });
        }
    };

    match node.ingest(key, &bytes).await {
        Ok(_) => Json(json!({ "status": "OK" })).into_response(),
        Err(e) => ingress_response(e),
    }
}

async fn bugs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.grid.snapshot().await)
}

async fn ping() -> impl IntoResponse {
    Json(json!({ "status": "OK" }))
}

async fn graph(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.grid.graph_elements().await)
}

async fn raw(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.grid.raw_graph().await)
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let node = &state.node;
    Json(
        node.metrics
            .report(&node.settings.node_id, node.settings.role, node.phase())
            .await,
    )
}

async fn clear(State(state): State<Arc<AppState>>) -> Response {
    match state.node.reload().await {
        Ok(count) => Json(json!({ "status": "OK", "gridbugs": count })).into_response(),
        Err(ReloadError::Busy) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "busy" }))).into_response()
        }
        Err(ReloadError::Config(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn time(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = Utc::now();
    Json(TimeReport {
        local_time: now.with_timezone(&Local).to_string(),
        utc: now.to_string(),
        ts: now.timestamp_micros() as f64 / 1_000_000.0,
        uptime_secs: state.node.metrics.uptime_secs(),
    })
}

async fn unsupported() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "error": "unsupported request" })),
    )
}
