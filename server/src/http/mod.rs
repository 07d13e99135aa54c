pub mod pipeline;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use api::PipelineError;

// maps the closed error taxonomy onto an HTTP status + JSON body. each
// variant gets a status of its own instead of folding everything into 500
pub struct AppError(pub PipelineError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            PipelineError::UnknownStep(_) => StatusCode::BAD_REQUEST,
            PipelineError::PipelineShapeError(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::NetworkError(_) => StatusCode::BAD_GATEWAY,
            PipelineError::FormatError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::CryptoAuthError(_) => StatusCode::FORBIDDEN,
            PipelineError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
            PipelineError::ResourceLimit(_) => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            axum::Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError(err)
    }
}
