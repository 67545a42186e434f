//! `/t/:size/:timestamp/:key/:n` — peer speed test responder (spec.md §6).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use sha1::{Digest, Sha1};
use tracing::instrument;

use super::error::ServeError;
use super::AppState;

fn expected_key(size: u64, ts: i64, cid: i64, client_key: &str) -> String {
    let joined = format!("hentai@home-speedtest-{size}-{ts}-{cid}-{client_key}");
    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

#[instrument(skip(state))]
pub async fn handle_speed_test(
    State(state): State<Arc<AppState>>,
    Path((size, ts, key, _n)): Path<(u64, i64, String, u64)>,
) -> Result<Response, ServeError> {
    let settings = state.settings.load();
    if settings.check_sha1 {
        let expected = expected_key(size, ts, settings.client_id, &settings.client_key);
        if expected != key {
            return Err(ServeError::Unauthorized("speed test signature mismatch".to_string()));
        }
    }

    let mut response = Response::new(Body::from(vec![0u8; size as usize]));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}
