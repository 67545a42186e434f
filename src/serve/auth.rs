//! Timestamp/signature validation shared by the `/h`, `/p`, and `/servercmd`
//! handlers (spec.md §4.4, §4.4.2, §4.4.4).

use sha1::{Digest, Sha1};

use crate::fileid::FileId;

/// Allowed clock skew, in seconds, between the request's embedded timestamp
/// and local time.
pub const MAX_TIME_LAG: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keystamp {
    pub timestamp: i64,
    pub sha1_prefix: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed keystamp")]
    MalformedKeystamp,
    #[error("timestamp outside allowed lag window")]
    TimestampOutOfRange,
    #[error("signature mismatch")]
    SignatureMismatch,
}

impl Keystamp {
    /// Parses `<unix>-<sha1-prefix>`.
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let (ts, prefix) = raw.split_once('-').ok_or(AuthError::MalformedKeystamp)?;
        let timestamp: i64 = ts.parse().map_err(|_| AuthError::MalformedKeystamp)?;
        if prefix.is_empty() {
            return Err(AuthError::MalformedKeystamp);
        }
        Ok(Self {
            timestamp,
            sha1_prefix: prefix.to_string(),
        })
    }
}

fn sha1_hex(s: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// True if `ts` is within [`MAX_TIME_LAG`] seconds of `now` (inclusive).
#[must_use]
pub fn within_time_lag(ts: i64, now: i64) -> bool {
    (ts - now).abs() <= MAX_TIME_LAG
}

/// Expected keystamp signature prefix (first 10 hex chars) for an `/h` request:
/// `hex(sha1(ts-textual(id)-key-hotlinkthis))`.
#[must_use]
pub fn expected_hit_signature(ts: i64, id: &FileId, key: &str) -> String {
    let joined = format!("{ts}-{}-{key}-hotlinkthis", id.textual());
    sha1_hex(&joined)[..10].to_string()
}

/// Validates a keystamp against an expected hit signature, honoring the
/// `check_timestamps`/`check_sha1` debug escape hatches.
pub fn validate_keystamp(
    keystamp: &Keystamp,
    id: &FileId,
    key: &str,
    now: i64,
    check_timestamps: bool,
    check_sha1: bool,
) -> Result<(), AuthError> {
    if check_timestamps && !within_time_lag(keystamp.timestamp, now) {
        return Err(AuthError::TimestampOutOfRange);
    }
    if check_sha1 {
        let expected = expected_hit_signature(keystamp.timestamp, id, key);
        if expected != keystamp.sha1_prefix {
            return Err(AuthError::SignatureMismatch);
        }
    }
    Ok(())
}

/// `/p` passkey: `hex(sha1(textual(id) + "I think we can put our differences
/// behind us." + hex(sha1(key + "For science."))[0:10] + "You monster."))[0:10]`.
#[must_use]
pub fn compute_passkey(id: &FileId, key: &str) -> String {
    let inner = sha1_hex(&format!("{key}For science."));
    let joined = format!(
        "{}I think we can put our differences behind us.{}You monster.",
        id.textual(),
        &inner[..10]
    );
    sha1_hex(&joined)[..10].to_string()
}

/// `/servercmd` signature: `hex(sha1(hentai@home-servercmd-command-kwds-cid-ts-key))`.
#[must_use]
pub fn expected_servercmd_signature(
    command: &str,
    kwds_raw: &str,
    cid: i64,
    ts: i64,
    key: &str,
) -> String {
    let joined =
        format!("hentai@home-servercmd-{command}-{kwds_raw}-{cid}-{ts}-{key}");
    sha1_hex(&joined)
}
