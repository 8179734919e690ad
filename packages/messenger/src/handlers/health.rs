use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    let hub = state.hub.stats().await;

    // A hub that no longer answers means no live delivery at all
    let status = match &hub {
        None => "unavailable",
        Some(_) if metrics.errors.websocket > 0 => "degraded",
        Some(_) => "healthy",
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        connections: metrics.connections.active,
        rooms: hub.map(|h| h.rooms).unwrap_or(0),
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - server counters plus a hub snapshot
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.stats().await.unwrap_or_default();
    Json(serde_json::json!({
        "server": state.metrics.snapshot(),
        "hub": hub,
    }))
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - database reachable and hub running
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.ping().await;
    let hub_ok = state.hub.stats().await.is_some();

    let body = serde_json::json!({
        "status": if db_ok && hub_ok { "ready" } else { "not_ready" },
        "database": if db_ok { "connected" } else { "disconnected" },
        "hub": if hub_ok { "running" } else { "stopped" },
    });

    if db_ok && hub_ok {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_helpers::{call, test_app_state};
    use axum::http::StatusCode;
    use chat_hub::Connection;

    #[tokio::test]
    async fn health_reports_rooms() {
        let (state, _tmp) = test_app_state().await;
        let (conn, _rx) = Connection::new(1);
        state.hub.register(&conn).await;
        state.hub.subscribe(&conn, vec![3, 4]).await;

        let app = crate::build_router(state);
        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["rooms"], 2);
    }

    #[tokio::test]
    async fn live_and_ready() {
        let (state, _tmp) = test_app_state().await;
        let app = crate::build_router(state);

        let (status, body) = call(&app, "GET", "/health/live", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");

        let (status, body) = call(&app, "GET", "/health/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");
        assert_eq!(body["hub"], "running");
    }

    #[tokio::test]
    async fn metrics_include_hub_snapshot() {
        let (state, _tmp) = test_app_state().await;
        state.metrics.frame_received();
        let app = crate::build_router(state);

        let (status, body) = call(&app, "GET", "/metrics", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server"]["frames"]["received"], 1);
        assert_eq!(body["hub"]["rooms"], 0);
        assert_eq!(body["hub"]["payloads_dropped"], 0);
    }
}
