use crate::server::{JobServer, JobUpdate};
use job_server_core::{HandlerId, HandlerRecord, Job, JobError, JobId, JobStatus};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

/// REST API routes
pub fn create_rest_api(server: Arc<JobServer>) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(submit_job))
        .route("/api/jobs/:job_id", get(get_job).patch(update_job))
        .route("/api/handlers", get(list_handlers))
        .route("/api/handlers/:handler_id", get(get_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(server)
}

/// Prometheus scrape endpoint, served on its own port
pub fn create_metrics_router(server: Arc<JobServer>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(server)
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    handler: String,
    max_attempts: u32,
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    queue_depth: usize,
    in_flight: usize,
}

/// Submit a new job
async fn submit_job(
    State(server): State<Arc<JobServer>>,
    body: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let Json(req) = body?;
    let job = server.submit_job(&req.handler, req.max_attempts).await?;

    Ok((StatusCode::CREATED, Json(job)))
}

/// List jobs, optionally filtered by status
async fn list_jobs(
    State(server): State<Arc<JobServer>>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let Query(query) = query?;
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let jobs = server
        .list_jobs()
        .await?
        .into_iter()
        .filter(|job| status.map_or(true, |s| job.status == s))
        .collect();

    Ok(Json(jobs))
}

/// Get job by ID
async fn get_job(
    State(server): State<Arc<JobServer>>,
    job_id: Result<Path<JobId>, PathRejection>,
) -> Result<Json<Job>, ApiError> {
    let Path(job_id) = job_id?;
    Ok(Json(server.get_job(job_id).await?))
}

/// Edit a job; `{"status": "FAILED"}` cancels it
async fn update_job(
    State(server): State<Arc<JobServer>>,
    job_id: Result<Path<JobId>, PathRejection>,
    body: Result<Json<JobUpdate>, JsonRejection>,
) -> Result<Json<Job>, ApiError> {
    let Path(job_id) = job_id?;
    let Json(update) = body?;
    Ok(Json(server.update_job(job_id, update).await?))
}

async fn list_handlers(
    State(server): State<Arc<JobServer>>,
) -> Result<Json<Vec<HandlerRecord>>, ApiError> {
    Ok(Json(server.list_handlers().await?))
}

async fn get_handler(
    State(server): State<Arc<JobServer>>,
    handler_id: Result<Path<HandlerId>, PathRejection>,
) -> Result<Json<HandlerRecord>, ApiError> {
    let Path(handler_id) = handler_id?;
    Ok(Json(server.get_handler(handler_id).await?))
}

/// Health check endpoint
async fn health_check(State(server): State<Arc<JobServer>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        queue_depth: server.queue_depth(),
        in_flight: server.in_flight(),
    })
}

async fn metrics_handler(State(server): State<Arc<JobServer>>) -> Result<String, ApiError> {
    server.refresh_gauges();
    server
        .metrics()
        .encode()
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidHandler(_) | JobError::InvalidMaxAttempts { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            JobError::JobNotFound(_) | JobError::HandlerNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            JobError::InvalidTransition { .. } | JobError::AttemptsExhausted { .. } => {
                ApiError::Conflict(err.to_string())
            }
            JobError::HandlerExecutionFailure(_)
            | JobError::PersistenceFailure(_)
            | JobError::RegistrationFailure(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
