use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Client;
use tracing::{instrument, warn};

use crate::fileid::FileId;

use super::{
    ApiResponse, CoordError, CLIENT_BUILD, MAX_TIME_LAG, join_ids, parse_vars, sign_action, Coord,
};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const READ_TIMEOUT_SECS: u64 = 60;

const DEFAULT_SCHEME: &str = "http";
const DEFAULT_HOST: &str = "rpc.hentaiathome.net";
const DEFAULT_PATH: &str = "clientapi.php";

/// Coordinator client over the `rpc.hentaiathome.net` clientapi, signing
/// every request with the shared client key (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct HathCoordClient {
    http: Client,
    client_id: i64,
    key: String,
    scheme: String,
    host: String,
    path: String,
}

impl HathCoordClient {
    /// # Errors
    ///
    /// Returns [`CoordError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed.
    pub fn new(client_id: i64, key: impl Into<String>) -> Result<Self, CoordError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .gzip(true)
            .build()?;
        Ok(Self {
            http,
            client_id,
            key: key.into(),
            scheme: DEFAULT_SCHEME.to_string(),
            host: DEFAULT_HOST.to_string(),
            path: DEFAULT_PATH.to_string(),
        })
    }

    /// Overrides the coordinator host, for tests driven against a local mock
    /// server.
    #[must_use]
    pub fn with_host(mut self, scheme: impl Into<String>, host: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self.host = host.into();
        self
    }

    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn build_url(&self, action: &str, argument: &str) -> String {
        let acttime = self.now();
        let actkey = sign_action(action, argument, self.client_id, acttime, &self.key);
        format!(
            "{}://{}/{}?clientbuild={}&act={}&add={}&actkey={}&acttime={}&cid={}",
            self.scheme,
            self.host,
            self.path,
            CLIENT_BUILD,
            urlencode(action),
            urlencode(argument),
            actkey,
            acttime,
            self.client_id,
        )
    }

    #[instrument(skip(self), fields(action = %action))]
    async fn request(&self, action: &str, argument: &str) -> Result<ApiResponse, CoordError> {
        let url = self.build_url(action, argument);
        let start = std::time::Instant::now();
        let resp = self.http.get(&url).send().await?;
        let body = resp.text().await?;
        let parsed = ApiResponse::from_body(&body);
        if !parsed.is_ok() {
            warn!(action, elapsed = ?start.elapsed(), message = %parsed.message, "coordinator action failed");
        }
        Ok(parsed)
    }

    async fn request_ok(&self, action: &str, argument: &str) -> Result<ApiResponse, CoordError> {
        self.request(action, argument).await?.into_result()
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[async_trait::async_trait]
impl Coord for HathCoordClient {
    async fn client_start(&self) -> Result<(), CoordError> {
        self.request_ok("client_start", "").await?;
        Ok(())
    }

    async fn client_login(&self) -> Result<(), CoordError> {
        self.request_ok("client_login", "").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn check_stats(&self) -> Result<(i64, i64), CoordError> {
        let resp = self.request_ok("server_stat", "").await?;
        let vars = parse_vars(&resp.lines);
        let server_time: i64 = vars
            .get("server_time")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.now());
        let min_client_build: i64 = vars
            .get("min_client_build")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if (self.now() - server_time).abs() > MAX_TIME_LAG {
            return Err(CoordError::TimeDesync);
        }
        if min_client_build > CLIENT_BUILD {
            return Err(CoordError::ClientVersionOld);
        }
        Ok((server_time, min_client_build))
    }

    async fn client_settings(&self) -> Result<HashMap<String, String>, CoordError> {
        let resp = self.request_ok("client_settings", "").await?;
        Ok(parse_vars(&resp.lines))
    }

    async fn still_alive(&self) -> Result<(), CoordError> {
        self.request_ok("still_alive", "").await?;
        Ok(())
    }

    async fn client_suspend(&self) -> Result<(), CoordError> {
        self.request_ok("client_suspend", "").await?;
        Ok(())
    }

    async fn client_resume(&self) -> Result<(), CoordError> {
        self.request_ok("client_resume", "").await?;
        Ok(())
    }

    async fn client_stop(&self) -> Result<(), CoordError> {
        self.request_ok("client_stop", "").await?;
        Ok(())
    }

    async fn more_files(&self) -> Result<(), CoordError> {
        self.request_ok("more_files", "").await?;
        Ok(())
    }

    async fn overload(&self) -> Result<(), CoordError> {
        self.request_ok("overload", "").await?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn file_register(&self, ids: &[FileId]) -> Result<(), CoordError> {
        self.request_ok("file_register", &join_ids(ids)).await?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn file_uncache(&self, ids: &[FileId]) -> Result<(), CoordError> {
        self.request_ok("file_uncache", &join_ids(ids)).await?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn download_list(&self, ids: &[FileId]) -> Result<HashMap<String, String>, CoordError> {
        let resp = self.request_ok("download_list", &join_ids(ids)).await?;
        let mut tokens = HashMap::with_capacity(resp.lines.len());
        for line in &resp.lines {
            if let Some((id, token)) = line.split_once('=') {
                tokens.insert(id.to_string(), token.to_string());
            }
        }
        Ok(tokens)
    }
}
