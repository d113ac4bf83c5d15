//! Axum JSON routes for image URL governance.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use igov_core::{PreviewJob, PreviewResult};
use igov_governance::{governance_from_env, Governance, ReportRange};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "igov-web";

#[derive(Clone)]
pub struct AppState {
    pub governance: Arc<Governance>,
}

impl AppState {
    pub fn new(governance: Arc<Governance>) -> Self {
        Self { governance }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewRequest {
    limit_per_entity_kind: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyQuery {
    range: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PreviewResponse<'a> {
    job_id: &'a str,
    result: &'a PreviewResult,
}

impl<'a> From<&'a PreviewJob> for PreviewResponse<'a> {
    fn from(job: &'a PreviewJob) -> Self {
        Self {
            job_id: &job.job_id,
            result: &job.result,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/governance/image-url/preview", post(preview_handler))
        .route("/governance/image-url/preview/{job_id}", get(preview_result_handler))
        .route("/governance/image-url/execute", post(execute_handler))
        .route("/governance/reports/daily", get(daily_report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let governance = Arc::new(governance_from_env().await?);
    let port = governance.config().web_port;

    let scheduler = governance.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!("snapshot scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "governance http server listening");
    axum::serve(listener, app(AppState::new(governance))).await?;
    Ok(())
}

/// An empty body stands for the default request.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("invalid request body: {err}")))
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: PreviewRequest = parse_body(&body)?;
    let job = state.governance.preview(request.limit_per_entity_kind).await;
    Ok(Json(PreviewResponse::from(job.as_ref())).into_response())
}

async fn preview_result_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<PreviewResult>, ApiError> {
    state
        .governance
        .preview_result(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("preview job {job_id} not found or expired")))
}

async fn execute_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ExecuteRequest = parse_body(&body)?;
    let outcome = state.governance.execute(request.job_id.as_deref(), None).await;
    if !outcome.result.report_persisted {
        warn!(job_id = %outcome.job_id, "execution report was not persisted");
    }
    Ok(Json(outcome).into_response())
}

async fn daily_report_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DailyQuery>,
) -> Result<Response, ApiError> {
    let range = match query.range.as_deref() {
        None => ReportRange::Week,
        Some(raw) => raw
            .parse::<ReportRange>()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?,
    };
    Ok(Json(state.governance.daily_report(range).await).into_response())
}
