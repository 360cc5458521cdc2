//! HTTP invocation surface.
//!
//! Thin JSON layer over the engine's operations. Routing, authentication
//! and device/session management belong to the API gateway in front of
//! this service; nothing here inspects more than the request body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::EngineError;
use crate::funds::{RetryScheduler, TransactionStore};
use crate::session::ContextMap;
use crate::workflow::{ExecutionId, TriggerPhase, WorkflowEngine};

pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<RetryScheduler>,
    pub transactions: Arc<dyn TransactionStore>,
}

#[derive(Debug, Deserialize)]
struct StartExecutionReq {
    user_id: i64,
    session_id: String,
    #[serde(default)]
    context: ContextMap,
}

#[derive(Debug, Deserialize)]
struct ExecuteStepReq {
    timing: TriggerPhase,
    #[serde(default)]
    input: ContextMap,
}

#[derive(Debug, Deserialize)]
struct CancelReq {
    reason: String,
}

fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) | EngineError::OtpExpired | EngineError::OtpLocked => {
            StatusCode::BAD_REQUEST
        }
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Concurrency(_) => StatusCode::CONFLICT,
        EngineError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        EngineError::Consistency(_) | EngineError::Storage(_) | EngineError::System(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_body(err: &EngineError) -> serde_json::Value {
    json!({
        "success": false,
        "error": err.to_string(),
        "structured_error": err.to_structured(),
    })
}

/// GET /api/v1/health
async fn health_check() -> impl IntoResponse {
    let timestamp_ms = chrono::Utc::now().timestamp_millis();
    Json(json!({
        "code": 0,
        "data": {
            "timestamp_ms": timestamp_ms,
            "build": option_env!("GIT_HASH").unwrap_or("unknown"),
        }
    }))
}

/// POST /api/v1/workflows/{workflow_id}/executions
async fn start_execution(
    Extension(state): Extension<Arc<AppState>>,
    Path(workflow_id): Path<i64>,
    Json(req): Json<StartExecutionReq>,
) -> impl IntoResponse {
    match state
        .engine
        .start_execution(workflow_id, req.user_id, &req.session_id, req.context)
        .await
    {
        Ok(execution) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "execution": execution })),
        )
            .into_response(),
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// POST /api/v1/executions/{execution_id}/steps/{step_id}
async fn execute_step(
    Extension(state): Extension<Arc<AppState>>,
    Path((execution_id, step_id)): Path<(String, i64)>,
    Json(req): Json<ExecuteStepReq>,
) -> impl IntoResponse {
    let execution_id: ExecutionId = match execution_id.parse() {
        Ok(id) => id,
        Err(_) => {
            let e = EngineError::Validation("invalid execution id".to_string());
            return (error_status(&e), Json(error_body(&e))).into_response();
        }
    };

    match state
        .engine
        .execute_step(execution_id, step_id, req.input, req.timing)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// POST /api/v1/executions/{execution_id}/complete
async fn complete_execution(
    Extension(state): Extension<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    let execution_id: ExecutionId = match execution_id.parse() {
        Ok(id) => id,
        Err(_) => {
            let e = EngineError::Validation("invalid execution id".to_string());
            return (error_status(&e), Json(error_body(&e))).into_response();
        }
    };

    match state.engine.complete_execution(execution_id).await {
        Ok(final_result) => {
            Json(json!({ "success": true, "final_result": final_result })).into_response()
        }
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// POST /api/v1/executions/{execution_id}/cancel
async fn cancel_execution(
    Extension(state): Extension<Arc<AppState>>,
    Path(execution_id): Path<String>,
    Json(req): Json<CancelReq>,
) -> impl IntoResponse {
    let execution_id: ExecutionId = match execution_id.parse() {
        Ok(id) => id,
        Err(_) => {
            let e = EngineError::Validation("invalid execution id".to_string());
            return (error_status(&e), Json(error_body(&e))).into_response();
        }
    };

    match state.engine.cancel_execution(execution_id, &req.reason).await {
        Ok(execution) => Json(json!({ "success": true, "execution": execution })).into_response(),
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// GET /api/v1/executions/{execution_id}
async fn get_execution(
    Extension(state): Extension<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> impl IntoResponse {
    let execution_id: ExecutionId = match execution_id.parse() {
        Ok(id) => id,
        Err(_) => {
            let e = EngineError::Validation("invalid execution id".to_string());
            return (error_status(&e), Json(error_body(&e))).into_response();
        }
    };

    match state.engine.execution(execution_id).await {
        Ok(Some(execution)) => Json(json!({ "execution": execution })).into_response(),
        Ok(None) => {
            let e = EngineError::NotFound(format!("execution {}", execution_id));
            (error_status(&e), Json(error_body(&e))).into_response()
        }
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// GET /api/v1/transactions/{reference}
async fn get_transaction(
    Extension(state): Extension<Arc<AppState>>,
    Path(reference): Path<String>,
) -> impl IntoResponse {
    match state.transactions.get(&reference).await {
        Ok(Some(transaction)) => Json(json!({ "transaction": transaction })).into_response(),
        Ok(None) => {
            let e = EngineError::NotFound(format!("transaction {}", reference));
            (error_status(&e), Json(error_body(&e))).into_response()
        }
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// GET /api/v1/transactions/{reference}/history
async fn get_transaction_history(
    Extension(state): Extension<Arc<AppState>>,
    Path(reference): Path<String>,
) -> impl IntoResponse {
    match state.transactions.history(&reference).await {
        Ok(history) => Json(json!({ "reference": reference, "history": history })).into_response(),
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

/// POST /api/v1/internal/retry-sweep
///
/// Manual sweep trigger for test environments. MUST stay behind `mock-api`.
#[cfg(feature = "mock-api")]
async fn run_retry_sweep(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    match state.scheduler.run_due_retries().await {
        Ok(sweep) => Json(json!({ "success": true, "sweep": sweep })).into_response(),
        Err(e) => (error_status(&e), Json(error_body(&e))).into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/api/v1/health", get(health_check))
        .route(
            "/api/v1/workflows/{workflow_id}/executions",
            post(start_execution),
        )
        .route(
            "/api/v1/executions/{execution_id}/steps/{step_id}",
            post(execute_step),
        )
        .route(
            "/api/v1/executions/{execution_id}/complete",
            post(complete_execution),
        )
        .route("/api/v1/executions/{execution_id}/cancel", post(cancel_execution))
        .route("/api/v1/executions/{execution_id}", get(get_execution))
        .route("/api/v1/transactions/{reference}", get(get_transaction))
        .route(
            "/api/v1/transactions/{reference}/history",
            get(get_transaction_history),
        );

    #[cfg(feature = "mock-api")]
    let router = router.route("/api/v1/internal/retry-sweep", post(run_retry_sweep));

    router.layer(Extension(state))
}

pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(%addr, "invocation surface listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}
