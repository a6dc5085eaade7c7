//! Liveness and readiness probes

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::routes::AppState;

/// The process is up and serving requests.
pub async fn liveness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    debug!("Liveness check requested");

    Ok(Json(json!({
        "status": "alive",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// PostgreSQL answers a trivial query through the pool.
pub async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    debug!("Readiness check requested");

    if let Err(e) = state.engine.ping().await {
        error!("Database health check failed: {}", e);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "database": "ok",
        "idle_connections": state.engine.database().idle_connections(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::unreachable_state;

    #[tokio::test]
    async fn test_liveness_check() {
        let result = liveness_check(State(unreachable_state())).await.unwrap();
        assert_eq!(result.0["status"], "alive");
    }

    #[tokio::test]
    async fn test_readiness_fails_without_database() {
        let result = readiness_check(State(unreachable_state())).await;
        assert_eq!(result.unwrap_err(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
