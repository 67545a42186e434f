//! Centralized `ServeError -> HTTP response` mapping (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::coord::CoordError;
use crate::frontend::FrontendError;
use crate::metadb::MetaDbError;

use super::auth::AuthError;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found")]
    NotFound,
    #[error("upstream coordinator error: {0}")]
    Coord(#[from] CoordError),
    #[error("metadata store error: {0}")]
    MetaDb(#[from] MetaDbError),
    #[error("content store error: {0}")]
    Frontend(#[from] FrontendError),
}

impl From<AuthError> for ServeError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MalformedKeystamp => ServeError::BadRequest(e.to_string()),
            AuthError::TimestampOutOfRange => ServeError::BadRequest(e.to_string()),
            AuthError::SignatureMismatch => ServeError::Unauthorized(e.to_string()),
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ServeError::NotFound => StatusCode::NOT_FOUND,
            ServeError::MetaDb(MetaDbError::NotFound) => StatusCode::NOT_FOUND,
            ServeError::Frontend(FrontendError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServeError::Coord(_) | ServeError::MetaDb(_) | ServeError::Frontend(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}
