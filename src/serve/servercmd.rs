//! `/servercmd/:command/:kwds/:timestamp/:key` — coordinator command dispatch
//! (spec.md §4.4.4).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::future::join_all;
use tracing::{instrument, warn};

use crate::fileid::FileId;

use super::args::Kwds;
use super::auth::{expected_servercmd_signature, within_time_lag};
use super::error::ServeError;
use super::proxy::add_file;
use super::AppState;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[instrument(skip(state), fields(command))]
pub async fn handle_servercmd(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Path((command, kwds_raw, timestamp, key)): Path<(String, String, String, String)>,
) -> Result<Response, ServeError> {
    let settings = state.settings.load();

    if !settings.rpc_server_ip.is_empty() && !settings.rpc_server_ip.contains(&addr.ip()) {
        return Err(ServeError::Unauthorized(
            "request did not originate from the coordinator".to_string(),
        ));
    }

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ServeError::BadRequest("bad timestamp".to_string()))?;
    if settings.check_timestamps && !within_time_lag(ts, now_unix()) {
        return Err(ServeError::BadRequest("timestamp outside allowed lag window".to_string()));
    }

    if settings.check_sha1 {
        // "-" is a URL placeholder for an empty kwds segment; the signed
        // message uses the empty string, not the literal dash.
        let kwds_signed = if kwds_raw == "-" { "" } else { &kwds_raw };
        let expected = expected_servercmd_signature(
            &command,
            kwds_signed,
            settings.client_id,
            ts,
            &settings.client_key,
        );
        if expected != key {
            return Err(ServeError::Unauthorized("signature mismatch".to_string()));
        }
    }

    let kwds = Kwds::parse(&kwds_raw);

    match command.as_str() {
        "speed_test" => Ok(speed_test(&kwds)),
        "cache_files" => Ok(cache_files(&state, &kwds).await),
        "proxy_test" => Ok(proxy_test(&state, &kwds).await),
        "threaded_proxy_test" => Ok(threaded_proxy_test(&state, &kwds).await),
        "refresh_settings" => Ok(refresh_settings(&state).await),
        "still_alive" => Ok("OK:I feel FANTASTIC and I'm still alive".into_response()),
        "cache_list" => Ok(cache_list(&state, &kwds).await?),
        other => Err(ServeError::BadRequest(format!("unknown servercmd: {other}"))),
    }
}

const MAX_SPEED_TEST_SIZE: u64 = 100 * 1024 * 1024;

fn speed_test(kwds: &Kwds) -> Response {
    let size: u64 = kwds
        .get("testsize")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
        .min(MAX_SPEED_TEST_SIZE);
    let mut response = Response::new(Body::from(vec![0u8; size as usize]));
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    response
}

/// `kwds` is `"<fileid>:<host>" = <key>` pairs; for each, fetch from the
/// named host, `addFile`, and emit one result line.
async fn cache_files(state: &Arc<AppState>, kwds: &Kwds) -> Response {
    let mut lines = Vec::new();
    for (key, token) in kwds.iter() {
        let Some((fileid_str, host)) = key.split_once(':') else {
            lines.push(format!("{key}:INVALID"));
            continue;
        };
        let Ok(id) = FileId::parse(fileid_str) else {
            lines.push(format!("{fileid_str}:INVALID"));
            continue;
        };
        let url = format!("http://{host}/image.php?f={fileid_str}&t={token}");
        match state.http.get(&url).send().await {
            Ok(resp) => match resp.bytes().await {
                Ok(bytes) => {
                    let result = add_file(state, &id, bytes).await;
                    lines.push(format!(
                        "{fileid_str}:{}",
                        if result.is_ok() { "OK" } else { "FAIL" }
                    ));
                }
                Err(_) => lines.push(format!("{fileid_str}:FAIL")),
            },
            Err(_) => lines.push(format!("{fileid_str}:FAIL")),
        }
    }
    lines.join("\n").into_response()
}

async fn proxy_test(state: &Arc<AppState>, kwds: &Kwds) -> Response {
    let Some(fileid_str) = kwds.get("fileid") else {
        return "FAIL-0".into_response();
    };
    let Ok(id) = FileId::parse(fileid_str) else {
        return "FAIL-0".into_response();
    };
    let Some(host) = kwds.get("host") else {
        return "FAIL-0".into_response();
    };
    let url = format!("http://{host}/r/{fileid_str}/test/1-1/proxytest");
    let start = std::time::Instant::now();
    match state.http.get(&url).send().await {
        Ok(resp) => match resp.bytes().await {
            Ok(bytes) if bytes.len() as u64 == id.size => {
                format!("{fileid_str}:OK-{:.3}", start.elapsed().as_secs_f64()).into_response()
            }
            _ => format!("{fileid_str}:FAIL-0").into_response(),
        },
        Err(e) => {
            warn!(error = %e, "proxy_test request failed");
            format!("{fileid_str}:FAIL-0").into_response()
        }
    }
}

async fn threaded_proxy_test(state: &Arc<AppState>, kwds: &Kwds) -> Response {
    let testcount: usize = kwds.get("testcount").and_then(|v| v.parse().ok()).unwrap_or(1);
    let host = kwds.get("host").unwrap_or("").to_string();
    let fileid_str = kwds.get("fileid").unwrap_or("").to_string();

    let start = std::time::Instant::now();
    let futures = (0..testcount).map(|_| {
        let state = Arc::clone(state);
        let host = host.clone();
        let fileid_str = fileid_str.clone();
        async move {
            let url = format!("http://{host}/r/{fileid_str}/test/1-1/proxytest");
            state.http.get(&url).send().await.is_ok()
        }
    });
    let results = join_all(futures).await;
    let passed = results.into_iter().filter(|ok| *ok).count();
    format!("OK:{passed}-{}", start.elapsed().as_millis()).into_response()
}

async fn refresh_settings(state: &Arc<AppState>) -> Response {
    match state.coord.client_settings().await {
        Ok(vars) => {
            let next = state.settings.load().apply_vars(&vars);
            state.settings.store(Arc::new(next));
            "true".into_response()
        }
        Err(e) => {
            warn!(error = %e, "refresh_settings failed to reach coordinator");
            "false".into_response()
        }
    }
}

async fn cache_list(state: &Arc<AppState>, kwds: &Kwds) -> Result<Response, ServeError> {
    let max: u64 = kwds.get("max_filecount").and_then(|v| v.parse().ok()).unwrap_or(0);
    let (tx, mut rx) = tokio::sync::mpsc::channel::<FileId>(256);
    let metadb = Arc::clone(&state.metadb);
    tokio::spawn(async move {
        let _ = metadb.get_batch(tx, max).await;
    });
    let mut lines = Vec::new();
    while let Some(id) = rx.recv().await {
        lines.push(id.textual());
    }
    Ok(lines.join("\n").into_response())
}
