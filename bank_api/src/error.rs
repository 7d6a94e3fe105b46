use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use engine::EngineError;
use serde_json::json;
use tracing::error;

/// Engine errors carry a stable machine-readable code; the HTTP layer maps
/// each kind to a status and returns `{error, message}` unchanged.
pub struct ApiError(pub EngineError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_)
            | EngineError::InsufficientCollateral { .. }
            | EngineError::InsufficientBalance
            | EngineError::InsufficientSavings => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::OracleUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Storage(_) | EngineError::Internal(_) => {
                error!(target = "bank", error = %self.0, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
