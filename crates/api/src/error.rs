use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use trunchbull_core::error::{ErrorKind, TrunchbullError};

/// Error returned by every JSON handler.
#[derive(Debug)]
pub enum ApiError {
    Core(TrunchbullError),
    BadRequest(String),
}

impl From<TrunchbullError> for ApiError {
    fn from(e: TrunchbullError) -> Self {
        ApiError::Core(e)
    }
}

/// HTTP status for an engine error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotAuthenticated | ErrorKind::AuthExpired => StatusCode::UNAUTHORIZED,
        ErrorKind::RateLimitTimeout => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamUnavailable | ErrorKind::MalformedResponse => StatusCode::BAD_GATEWAY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Config => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PersistenceFailure | ErrorKind::Cancelled | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Core(e) => {
                let kind = e.kind();
                let status = status_for(kind);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (status, serde_json::to_value(kind).unwrap_or_default(), e.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, json!("bad_request"), message),
        };
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_unauthorized() {
        assert_eq!(status_for(ErrorKind::NotAuthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::AuthExpired), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn upstream_errors_map_to_gateway_codes() {
        assert_eq!(
            status_for(ErrorKind::RateLimitTimeout),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(ErrorKind::RateLimited), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::UpstreamUnavailable), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::MalformedResponse), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn remaining_kinds() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Config), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(
            status_for(ErrorKind::PersistenceFailure),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
