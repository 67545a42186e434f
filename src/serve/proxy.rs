//! `/p/:kwds/:filename` local-user proxy and the shared proxy-fill flow used
//! by both `/h` misses and `/p` (spec.md §4.4.2, §4.4.3).

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{instrument, warn};

use crate::fileid::FileId;
use crate::settings::{is_local_address, ProxyMode};

use super::auth::compute_passkey;
use super::error::ServeError;
use super::AppState;

/// Maximum peer-fetch attempts before falling back to a direct (`nl=1`) fetch.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 4;

#[instrument(skip(state), fields(fileid))]
pub async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Path((kwds, _filename)): Path<(String, String)>,
) -> Result<Response, ServeError> {
    let kwds = super::args::Kwds::parse(&kwds);
    let settings = state.settings.load();

    if settings.proxy_mode == ProxyMode::Disabled {
        return Err(ServeError::Unauthorized("proxying is disabled".to_string()));
    }

    if settings.proxy_mode.requires_local() && !is_local_address(addr.ip()) {
        return Err(ServeError::Unauthorized("client is not local".to_string()));
    }

    let fileid = kwds
        .get("fileid")
        .ok_or_else(|| ServeError::BadRequest("missing fileid".to_string()))?;
    let id = FileId::parse(fileid).map_err(|e| ServeError::BadRequest(e.to_string()))?;

    if settings.proxy_mode.requires_passkey() {
        let passkey = kwds
            .get("passkey")
            .ok_or_else(|| ServeError::Unauthorized("missing passkey".to_string()))?;
        if passkey != compute_passkey(&id, &settings.client_key) {
            return Err(ServeError::Unauthorized("passkey mismatch".to_string()));
        }
    }

    if state.metadb.exists(&id).await? {
        let _ = state.use_tx.try_send(id.clone());
        return Ok(state.frontend.handle(&id).await);
    }

    let gallery = kwds.get("g").unwrap_or("1");
    let page = kwds.get("p").unwrap_or("1");
    let tokens = state.coord.download_list(std::slice::from_ref(&id)).await?;
    let token = tokens
        .get(&id.textual())
        .cloned()
        .ok_or_else(|| ServeError::BadRequest("coordinator issued no token".to_string()))?;
    Ok(proxy_fill(&state, &id, &token, gallery, page, &id.textual()).await?)
}

/// Streams `id` from the peer network (or a direct image-server fallback on
/// the last attempt), tee-ing the body into an in-memory buffer that is
/// persisted asynchronously after the response has been sent.
#[instrument(skip(state), fields(id = %id.textual()))]
pub async fn proxy_fill(
    state: &Arc<AppState>,
    id: &FileId,
    token: &str,
    gallery: &str,
    page: &str,
    filename: &str,
) -> Result<Response, ServeError> {
    let settings = state.settings.load();
    let mut last_err = None;

    for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
        let direct = attempt == MAX_DOWNLOAD_ATTEMPTS;
        let mut url = format!(
            "http://{}/r/{}/{token}/{gallery}-{page}/{filename}",
            settings.request_server,
            id.textual()
        );
        if direct {
            url.push_str("?nl=1");
        }

        match fetch_body(&state.http, &url, id.size).await {
            Ok(bytes) => {
                spawn_persist(Arc::clone(state), id.clone(), bytes.clone());
                let mut response = Response::new(Body::from(bytes));
                *response.status_mut() = StatusCode::OK;
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(id.size));
                return Ok(response);
            }
            Err(e) => {
                warn!(attempt, error = %e, "proxy-fill attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(ServeError::BadRequest(format!(
        "all proxy-fill attempts failed: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn fetch_body(client: &reqwest::Client, url: &str, expected: u64) -> Result<Bytes, reqwest::Error> {
    let resp = client.get(url).send().await?;
    let bytes = resp.bytes().await?;
    if bytes.len() as u64 != expected {
        warn!(got = bytes.len(), expected, "proxy-fill body length mismatch");
    }
    Ok(bytes)
}

fn spawn_persist(state: Arc<AppState>, id: FileId, bytes: Bytes) {
    tokio::spawn(async move {
        if let Err(e) = add_file(&state, &id, bytes).await {
            warn!(id = %id.textual(), error = %e, "background addFile failed");
        }
    });
}

/// `addFile`: idempotent ingest of a proxy-filled body into the local cache
/// (spec.md §4.4.3).
pub async fn add_file(state: &Arc<AppState>, id: &FileId, bytes: Bytes) -> Result<(), ServeError> {
    if state.metadb.exists(id).await? {
        return Ok(());
    }
    let mut reader = std::io::Cursor::new(bytes);
    if let Err(e) = state.frontend.add(id, &mut reader).await {
        return Err(ServeError::Frontend(e));
    }
    if let Err(e) = state.frontend.check(id).await {
        let _ = state.frontend.remove(id).await;
        return Err(ServeError::Frontend(e));
    }
    state.metadb.add(id).await?;
    let _ = state.register_tx.try_send(id.clone());
    Ok(())
}
