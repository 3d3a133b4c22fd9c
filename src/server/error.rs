//! HTTP mapping for the broker error taxonomy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::BrokerError;

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(pub BrokerError);

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    #[serde(rename = "type")]
    error_type: &'static str,
    code: &'static str,
    message: &'a str,
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::Validation(_) => StatusCode::BAD_REQUEST,
            BrokerError::Conflict(_) => StatusCode::CONFLICT,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::ConfigMissing(_)
            | BrokerError::Upstream(_)
            | BrokerError::Shape { .. }
            | BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.0.to_string();
        (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    error_type: status.canonical_reason().unwrap_or("Unknown Status Code"),
                    code: self.0.code(),
                    message: &message,
                },
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: BrokerError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(BrokerError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(BrokerError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(BrokerError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(BrokerError::Upstream("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(BrokerError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
