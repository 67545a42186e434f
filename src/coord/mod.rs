//! Coordinator client: signed request builder and response parser for the
//! upstream RPC coordinator (spec.md §4.3).

mod client;

pub use client::HathCoordClient;

use std::collections::HashMap;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::fileid::FileId;
use crate::static_range::StaticRanges;

/// Compiled-in client build number, compared against `min_client_build`.
pub const CLIENT_BUILD: i64 = 176;

/// Maximum ids per `file_register`/`file_uncache` request; [`crate::loops`]
/// chunks larger batches before calling [`Coord`].
pub const MAX_IDS_PER_BATCH: usize = 50;

/// Allowed clock skew (seconds) between this node and the coordinator/peers.
pub const MAX_TIME_LAG: i64 = 600;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("client key has expired")]
    KeyExpired,
    #[error("failed coordinator connect test")]
    ConnectTest,
    #[error("startup flood protection is active, retry later")]
    StartupFlood,
    #[error("another client with this id is already connected")]
    OtherClientConnected,
    #[error("local clock is out of sync with the coordinator by more than {MAX_TIME_LAG}s")]
    TimeDesync,
    #[error("client build is older than the coordinator's minimum required build")]
    ClientVersionOld,
    #[error("unexpected coordinator response: {0}")]
    Unexpected(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Parsed coordinator response: first line is the status token, remaining
/// lines are the payload.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub message: String,
    pub lines: Vec<String>,
}

impl ApiResponse {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.message == "OK"
    }

    pub fn from_body(body: &str) -> Self {
        let mut lines = body.lines().map(str::to_string);
        let message = lines.next().unwrap_or_default();
        Self {
            message,
            lines: lines.collect(),
        }
    }

    /// Maps the first line to a [`CoordError`] when it is a known failure
    /// token; returns `Ok(())` for `OK`, and `Unexpected` otherwise.
    pub fn into_result(self) -> Result<ApiResponse, CoordError> {
        if self.is_ok() {
            return Ok(self);
        }
        if self.message.starts_with("FAIL_CONNECT_TEST") {
            return Err(CoordError::ConnectTest);
        }
        if self.message.starts_with("FAIL_STARTUP_FLOOD") {
            return Err(CoordError::StartupFlood);
        }
        if self.message.starts_with("FAIL_OTHER_CLIENT_CONNECTED") {
            return Err(CoordError::OtherClientConnected);
        }
        if self.message.starts_with("KEY_EXPIRED") {
            return Err(CoordError::KeyExpired);
        }
        Err(CoordError::Unexpected(self.message))
    }
}

/// Parses `key=value` payload lines, trimming whitespace around both sides.
/// Lines without exactly one `=` are ignored (spec.md §4.3 parsing rules).
#[must_use]
pub fn parse_vars(lines: &[String]) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in lines {
        let parts: Vec<&str> = line.split('=').collect();
        if parts.len() != 2 {
            continue;
        }
        vars.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
    }
    vars
}

/// Parses a semicolon-separated list of 4-hex-char static range keys.
/// Fails the whole parse if any entry isn't exactly 4 hex chars.
pub fn parse_static_ranges(s: &str) -> Result<StaticRanges, CoordError> {
    let mut keys = Vec::new();
    for part in s.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part.len() != 4 {
            return Err(CoordError::Unexpected(format!("bad static range entry: {part}")));
        }
        let key = u16::from_str_radix(part, 16)
            .map_err(|_| CoordError::Unexpected(format!("bad static range entry: {part}")))?;
        keys.push(key);
    }
    Ok(StaticRanges::from_keys(keys))
}

/// Computes `hex(sha1("hentai@home" - action - argument - cid - acttime - key))`.
#[must_use]
pub fn sign_action(action: &str, argument: &str, cid: i64, acttime: i64, key: &str) -> String {
    let joined = format!("hentai@home-{action}-{argument}-{cid}-{acttime}-{key}");
    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Joins a list of textual [`FileId`]s with `;`, for use as a request argument.
#[must_use]
pub fn join_ids(ids: &[FileId]) -> String {
    ids.iter().map(FileId::textual).collect::<Vec<_>>().join(";")
}

/// Coordinator RPC capability the serving layer and orchestration loops
/// depend on.
#[async_trait]
pub trait Coord: Send + Sync {
    async fn client_start(&self) -> Result<(), CoordError>;
    async fn client_login(&self) -> Result<(), CoordError>;
    /// Returns `(server_time, min_client_build)` and enforces the freshness
    /// checks described in spec.md §4.3 (`TimeDesync`, `ClientVersionOld`).
    async fn check_stats(&self) -> Result<(i64, i64), CoordError>;
    async fn client_settings(&self) -> Result<HashMap<String, String>, CoordError>;
    async fn still_alive(&self) -> Result<(), CoordError>;
    async fn client_suspend(&self) -> Result<(), CoordError>;
    async fn client_resume(&self) -> Result<(), CoordError>;
    async fn client_stop(&self) -> Result<(), CoordError>;
    async fn more_files(&self) -> Result<(), CoordError>;
    async fn overload(&self) -> Result<(), CoordError>;
    async fn file_register(&self, ids: &[FileId]) -> Result<(), CoordError>;
    async fn file_uncache(&self, ids: &[FileId]) -> Result<(), CoordError>;
    /// Returns a download token per id, keyed by the id's textual form.
    async fn download_list(&self, ids: &[FileId]) -> Result<HashMap<String, String>, CoordError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_vars_matches_spec_scenario_5() {
        let lines: Vec<String> = [
            "s= pek ",
            "  int=1123",
            "int64=  75565  ",
            "uint64=6675565",
            "  int64-2=75565=?",
            "ranges   = aaaa;bbbb;cccc;ffff;",
            "badranges=aaaa;bbbb;cccc;fockyo;",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let vars = parse_vars(&lines);
        assert_eq!(vars.len(), 6);
        assert_eq!(vars.get("s").unwrap(), "pek");
        assert_eq!(vars.get("int").unwrap(), "1123");
        assert_eq!(vars.get("ranges").unwrap(), "aaaa;bbbb;cccc;ffff");
        assert!(parse_static_ranges(vars.get("badranges").unwrap()).is_err());
    }

    #[test]
    fn parse_vars_rejects_lines_without_single_equals() {
        let lines: Vec<String> = vec!["int64-2=75565=?".to_string(), "noequals".to_string()];
        let vars = parse_vars(&lines);
        assert!(vars.is_empty());
    }

    #[test]
    fn parse_static_ranges_builds_expected_set() {
        let ranges = parse_static_ranges("aaaa;bbbb;cccc;ffff;").unwrap();
        for k in [0xAAAAu16, 0xBBBB, 0xCCCC, 0xFFFF] {
            assert!(ranges.contains_key(k));
        }
    }

    #[test]
    fn parse_static_ranges_fails_on_bad_entry() {
        assert!(parse_static_ranges("aaaa;bbbb;cccc;fockyo;").is_err());
    }

    #[test]
    fn sign_action_is_deterministic() {
        let a = sign_action("still_alive", "", 1345, 10666, "12345");
        let b = sign_action("still_alive", "", 1345, 10666, "12345");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn api_response_parses_status_and_payload() {
        let r = ApiResponse::from_body("OK\nserver_time=123\nmin_client_build=1");
        assert!(r.is_ok());
        assert_eq!(r.lines.len(), 2);
    }

    #[test]
    fn api_response_maps_known_failure_tokens() {
        let r = ApiResponse::from_body("FAIL_STARTUP_FLOOD");
        assert!(matches!(r.into_result(), Err(CoordError::StartupFlood)));
    }
}
