//! API routes

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tablecraft_core::{CoreError, DdlOperation, DmlOperation, Engine, PgPool};
use tracing::debug;

use crate::errors::ApiError;
use crate::health::{liveness_check, readiness_check};
use crate::metrics::{self, metrics_handler};
use crate::response::Envelope;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine<PgPool>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Engine<PgPool>) -> Self {
        Self {
            engine: Arc::new(engine),
            start_time: Instant::now(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ddl", post(ddl_handler))
        .route("/api/dml", post(dml_handler))
        .route("/api/query", post(query_handler))
        .route("/api/schema", get(schema_handler))
        .route("/health/live", get(liveness_check))
        .route("/health/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

type ApiResult = Result<Json<Envelope>, ApiError>;

/// `POST /api/ddl` with `{"operations": [...]}`
pub async fn ddl_handler(State(state): State<AppState>, payload: Result<Json<Value>, JsonRejection>) -> ApiResult {
    let started = Instant::now();
    let result = async {
        let operations = operations(payload)?
            .into_iter()
            .map(DdlOperation::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        let report = state.engine.execute_ddl(&operations).await?;
        metrics::record_operations(report.applied.iter().map(|applied| applied.operation));
        Ok::<_, ApiError>(Envelope::success("DDL operations applied successfully", to_data(&report)?))
    }
    .await;
    finish("ddl", started, result)
}

/// `POST /api/dml` with `{"operations": [...]}`
pub async fn dml_handler(State(state): State<AppState>, payload: Result<Json<Value>, JsonRejection>) -> ApiResult {
    let started = Instant::now();
    let result = async {
        let operations = operations(payload)?
            .into_iter()
            .map(DmlOperation::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        let outcomes = state.engine.execute_dml(&operations).await?;
        metrics::record_operations(operations.iter().map(DmlOperation::label));
        Ok::<_, ApiError>(Envelope::success("DML operations applied successfully", to_data(&outcomes)?))
    }
    .await;
    finish("dml", started, result)
}

/// `POST /api/query` with `{"query": "..."}`
pub async fn query_handler(State(state): State<AppState>, payload: Result<Json<Value>, JsonRejection>) -> ApiResult {
    let started = Instant::now();
    let result = async {
        let Json(body) = payload?;
        let sql = body
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidPayload("query must be a string".to_string()))?;

        let outcome = state.engine.execute_query(sql).await?;
        Ok::<_, ApiError>(Envelope::success("Query executed successfully", to_data(&outcome)?))
    }
    .await;
    finish("query", started, result)
}

/// `GET /api/schema`
pub async fn schema_handler(State(state): State<AppState>) -> ApiResult {
    let started = Instant::now();
    let result = async {
        let schemas = state.engine.schemas().await?;
        debug!(tables = schemas.len(), "Listed schemas");
        Ok::<_, ApiError>(Envelope::success("Schemas retrieved successfully", to_data(&schemas)?))
    }
    .await;
    finish("schema", started, result)
}

fn operations(payload: Result<Json<Value>, JsonRejection>) -> Result<Vec<Value>, ApiError> {
    let Json(body) = payload?;
    let operations = match body {
        Value::Object(mut map) => match map.remove("operations") {
            Some(Value::Array(operations)) => operations,
            _ => return Err(CoreError::InvalidPayload("operations must be an array".to_string()).into()),
        },
        _ => return Err(CoreError::InvalidPayload("request body must be an object".to_string()).into()),
    };

    if operations.is_empty() {
        return Err(CoreError::InvalidPayload("operations must not be empty".to_string()).into());
    }
    Ok(operations)
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    Ok(serde_json::to_value(value).map_err(CoreError::from)?)
}

fn finish(endpoint: &'static str, started: Instant, result: Result<Envelope, ApiError>) -> ApiResult {
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => {
            e.log(endpoint);
            e.kind()
        }
    };
    metrics::record_request(endpoint, status, started.elapsed().as_secs_f64());
    result.map(Json)
}
