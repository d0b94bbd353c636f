pub mod auth;
pub mod conversations;
pub mod groups;
pub mod middleware;

use axum::http::StatusCode;
use tracing::error;

use lattice_messaging::ChatError;

/// Maps the service error taxonomy onto HTTP status codes for the fallback
/// request/response surface.
pub(crate) fn status_for(err: ChatError) -> StatusCode {
    match err {
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
        ChatError::Conflict(_) => StatusCode::CONFLICT,
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::Storage(e) => {
            error!("storage failure: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
