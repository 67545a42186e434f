//! `/h/:fileid/:kwds/:filename` — the image hit/miss/proxy state machine
//! (spec.md §4.4).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use tracing::instrument;

use crate::fileid::FileId;

use super::auth::{validate_keystamp, Keystamp};
use super::error::ServeError;
use super::proxy::proxy_fill;
use super::AppState;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[instrument(skip(state), fields(fileid))]
pub async fn handle_image(
    State(state): State<Arc<AppState>>,
    Path((fileid, kwds, _filename)): Path<(String, String, String)>,
) -> Result<Response, ServeError> {
    let kwds = super::args::Kwds::parse(&kwds);
    let raw_keystamp = kwds
        .get("keystamp")
        .ok_or_else(|| ServeError::BadRequest("missing keystamp".to_string()))?;
    let keystamp = Keystamp::parse(raw_keystamp)?;

    let id = FileId::parse(&fileid).map_err(|e| ServeError::BadRequest(e.to_string()))?;

    let settings = state.settings.load();
    validate_keystamp(
        &keystamp,
        &id,
        &settings.client_key,
        now_unix(),
        settings.check_timestamps,
        settings.check_sha1,
    )?;

    if state.metadb.exists(&id).await? {
        let _ = state.use_tx.try_send(id.clone());
        return Ok(state.frontend.handle(&id).await);
    }

    if settings.static_ranges.contains(&id) {
        let tokens = state.coord.download_list(std::slice::from_ref(&id)).await?;
        let token = tokens
            .get(&id.textual())
            .cloned()
            .ok_or_else(|| ServeError::BadRequest("coordinator issued no token".to_string()))?;
        return Ok(proxy_fill(&state, &id, &token, "1", "1", &id.textual()).await?);
    }

    Ok((axum::http::StatusCode::NOT_FOUND, "404: not in static range").into_response())
}
