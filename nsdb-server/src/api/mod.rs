//! HTTP API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use nsdb_core::statement::StatementParser;
use nsdb_core::{Bit, Engine, NsdbError, NsdbValue, StatementResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<Engine>;

/// Create the API router
pub fn create_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/statement", post(statement))
        .route("/write", post(write))
        .route("/schemas/:db/:namespace/:metric", get(schema))
        .route("/metrics/:db/:namespace", get(metrics))
        .route("/count/:db/:namespace/:metric", get(count))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatementRequest {
    pub db: String,
    pub namespace: String,
    pub statement: String,
}

#[derive(Debug, Serialize)]
pub struct StatementResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Bit>>,
    pub outcome: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub db: String,
    pub namespace: String,
    pub metric: String,
    pub timestamp: i64,
    pub value: NsdbValue,
    #[serde(default)]
    pub dimensions: BTreeMap<String, NsdbValue>,
    #[serde(default)]
    pub tags: BTreeMap<String, NsdbValue>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub metric: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_status(e: &NsdbError) -> StatusCode {
    match e {
        NsdbError::Parse(_) | NsdbError::Plan(_) | NsdbError::SchemaConflict { .. } => {
            StatusCode::BAD_REQUEST
        }
        NsdbError::UnknownMetric(_) | NsdbError::UnknownNamespace(_) => StatusCode::NOT_FOUND,
        NsdbError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: NsdbError) -> (StatusCode, Json<ErrorResponse>) {
    (
        error_status(&e),
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: nsdb_core::VERSION.to_string(),
    })
}

async fn statement(
    State(engine): State<AppState>,
    Json(req): Json<StatementRequest>,
) -> Result<Json<StatementResponse>, (StatusCode, Json<ErrorResponse>)> {
    let parsed =
        StatementParser::parse(&req.db, &req.namespace, &req.statement).map_err(reject)?;
    let result = engine.execute(&parsed).map_err(reject)?;

    let response = match result {
        StatementResult::SelectExecuted(records) => StatementResponse {
            records: Some(records),
            outcome: "executed".to_string(),
        },
        StatementResult::InsertAccepted => StatementResponse {
            records: None,
            outcome: "insert accepted".to_string(),
        },
        StatementResult::DeleteAccepted => StatementResponse {
            records: None,
            outcome: "delete accepted".to_string(),
        },
        StatementResult::MetricDropped => StatementResponse {
            records: None,
            outcome: "metric dropped".to_string(),
        },
    };
    Ok(Json(response))
}

async fn write(
    State(engine): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let bit = Bit {
        timestamp: req.timestamp,
        value: req.value,
        dimensions: req.dimensions,
        tags: req.tags,
    };
    engine
        .write(&req.db, &req.namespace, &req.metric, bit)
        .map_err(reject)?;
    Ok(StatusCode::ACCEPTED)
}

async fn schema(
    State(engine): State<AppState>,
    Path((db, namespace, metric)): Path<(String, String, String)>,
) -> Result<Json<nsdb_core::schema::Schema>, (StatusCode, Json<ErrorResponse>)> {
    let schema = engine.get_schema(&db, &namespace, &metric).map_err(reject)?;
    Ok(Json(schema))
}

async fn metrics(
    State(engine): State<AppState>,
    Path((db, namespace)): Path<(String, String)>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<ErrorResponse>)> {
    let metrics = engine.get_metrics(&db, &namespace).map_err(reject)?;
    Ok(Json(metrics))
}

async fn count(
    State(engine): State<AppState>,
    Path((db, namespace, metric)): Path<(String, String, String)>,
) -> Result<Json<CountResponse>, (StatusCode, Json<ErrorResponse>)> {
    let count = engine.get_count(&db, &namespace, &metric).map_err(reject)?;
    Ok(Json(CountResponse { metric, count }))
}
