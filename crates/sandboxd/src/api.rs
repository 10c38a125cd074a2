use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox::ExecutionResult;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::ServiceError;
use crate::router::{
    ExtendRequest, ExtendResponse, ListResponse, SandboxRef, SubmissionRouter, SubmitRequest,
    SubmitResponse, TerminateResponse,
};
use crate::types::SandboxStatus;

/// Room for JSON escaping of the source plus the other fields. The exact
/// size cap is enforced on the decoded code.
const BODY_OVERHEAD: usize = 64 * 1024;
const ESCAPE_FACTOR: usize = 6;

pub fn router(submissions: SubmissionRouter) -> Router {
    let body_limit = submissions
        .orchestrator()
        .policy()
        .max_source_bytes
        .saturating_mul(ESCAPE_FACTOR)
        .saturating_add(BODY_OVERHEAD);

    Router::new()
        .route("/submit", post(submit))
        .route("/execute", post(execute))
        .route("/extend", post(extend))
        .route("/list", get(list))
        .route("/terminate", post(terminate))
        .route("/sandboxes/:id", get(status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(submissions)
}

/// Error body: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

fn status_for(e: &ServiceError) -> StatusCode {
    match e {
        ServiceError::UnsupportedLanguage(_) | ServiceError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Busy(_) => StatusCode::CONFLICT,
        ServiceError::Expired(_) => StatusCode::GONE,
        ServiceError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Internal(_)
        | ServiceError::Sandbox(_)
        | ServiceError::Config(_)
        | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self {
            status: status_for(&e),
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                code: "PayloadTooLarge",
                message: rejection.body_text(),
            };
        }
        ServiceError::InvalidRequest(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() && self.status != StatusCode::SERVICE_UNAVAILABLE {
            error!(code = self.code, message = %self.message, "request failed");
        }
        let body = json!({ "error": { "code": self.code, "message": self.message } });
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn submit(
    State(router): State<SubmissionRouter>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<SubmitResponse> {
    let Json(request) = body?;
    Ok(Json(router.submit(request).await?))
}

async fn execute(
    State(router): State<SubmissionRouter>,
    body: Result<Json<SandboxRef>, JsonRejection>,
) -> ApiResult<ExecutionResult> {
    let Json(request) = body?;
    Ok(Json(router.execute(request).await?))
}

async fn extend(
    State(router): State<SubmissionRouter>,
    body: Result<Json<ExtendRequest>, JsonRejection>,
) -> ApiResult<ExtendResponse> {
    let Json(request) = body?;
    Ok(Json(router.extend(request)?))
}

async fn list(State(router): State<SubmissionRouter>) -> ApiResult<ListResponse> {
    Ok(Json(router.list()?))
}

async fn terminate(
    State(router): State<SubmissionRouter>,
    body: Result<Json<SandboxRef>, JsonRejection>,
) -> ApiResult<TerminateResponse> {
    let Json(request) = body?;
    Ok(Json(router.terminate(request).await?))
}

async fn status(
    State(router): State<SubmissionRouter>,
    Path(id): Path<String>,
) -> ApiResult<SandboxStatus> {
    Ok(Json(router.status(&id)?))
}
