//! The HTTP-level request-serving state machine: routes the coordinator
//! directs traffic to (spec.md §4.4).

pub mod args;
pub mod auth;
pub mod error;
mod image;
mod misc;
mod proxy;
mod servercmd;
mod speedtest;

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::coord::Coord;
use crate::fileid::FileId;
use crate::frontend::Frontend;
use crate::metadb::MetaDb;
use crate::settings::Settings;

/// Capacity of the use/register intent channels (spec.md §4.5, §5).
pub const BATCH_CHANNEL_CAPACITY: usize = 100;

/// Shared state injected into every route handler.
pub struct AppState {
    pub frontend: Arc<dyn Frontend>,
    pub metadb: Arc<dyn MetaDb>,
    pub coord: Arc<dyn Coord>,
    pub settings: ArcSwap<Settings>,
    pub http: reqwest::Client,
    pub use_tx: mpsc::Sender<FileId>,
    pub register_tx: mpsc::Sender<FileId>,
}

impl AppState {
    #[must_use]
    pub fn new(
        frontend: Arc<dyn Frontend>,
        metadb: Arc<dyn MetaDb>,
        coord: Arc<dyn Coord>,
        settings: Settings,
        http: reqwest::Client,
        use_tx: mpsc::Sender<FileId>,
        register_tx: mpsc::Sender<FileId>,
    ) -> Self {
        Self {
            frontend,
            metadb,
            coord,
            settings: ArcSwap::from_pointee(settings),
            http,
            use_tx,
            register_tx,
        }
    }
}

/// Builds the route table described in spec.md §4.4.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/h/:fileid/:kwds/:filename", get(image::handle_image))
        .route("/p/:kwds/:filename", get(proxy::handle_proxy))
        .route(
            "/servercmd/:command/:kwds/:timestamp/:key",
            get(servercmd::handle_servercmd),
        )
        .route("/t/:size/:timestamp/:key/:n", get(speedtest::handle_speed_test))
        .route("/favicon.ico", get(misc::favicon))
        .route("/robots.txt", get(misc::robots))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordError;
    use crate::fileid::FileType;
    use crate::frontend::DiskFrontend;
    use crate::metadb::SqliteMetaDb;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct StubCoord;

    #[async_trait]
    impl Coord for StubCoord {
        async fn client_start(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn client_login(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn check_stats(&self) -> Result<(i64, i64), CoordError> {
            Ok((0, 0))
        }
        async fn client_settings(&self) -> Result<HashMap<String, String>, CoordError> {
            Ok(HashMap::new())
        }
        async fn still_alive(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn client_suspend(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn client_resume(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn client_stop(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn more_files(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn overload(&self) -> Result<(), CoordError> {
            Ok(())
        }
        async fn file_register(&self, _ids: &[FileId]) -> Result<(), CoordError> {
            Ok(())
        }
        async fn file_uncache(&self, _ids: &[FileId]) -> Result<(), CoordError> {
            Ok(())
        }
        async fn download_list(
            &self,
            _ids: &[FileId],
        ) -> Result<HashMap<String, String>, CoordError> {
            Ok(HashMap::new())
        }
    }

    async fn build_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let frontend: Arc<dyn Frontend> = Arc::new(DiskFrontend::new(dir.path()));
        let metadb: Arc<dyn MetaDb> = Arc::new(SqliteMetaDb::open_in_memory().await.unwrap());
        let coord: Arc<dyn Coord> = Arc::new(StubCoord);
        let (use_tx, _use_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let (register_tx, _register_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let mut settings = Settings::default();
        settings.client_key = "12345".to_string();
        settings.client_id = 1345;
        settings.check_timestamps = false;
        let state = Arc::new(AppState::new(
            frontend,
            metadb,
            coord,
            settings,
            reqwest::Client::new(),
            use_tx,
            register_tx,
        ));
        (state, dir)
    }

    #[tokio::test]
    async fn hit_serve_returns_200_with_full_body() {
        let (state, _dir) = build_state().await;

        let data = vec![7u8; 42];
        let mut hasher = sha1::Sha1::new();
        use sha1::Digest;
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();
        let id = FileId::new(hash, FileType::Png, 42, 1920, 1080).unwrap();

        let mut reader = std::io::Cursor::new(data);
        state.frontend.add(&id, &mut reader).await.unwrap();
        state.metadb.add(&id).await.unwrap();

        let ts = 10666i64;
        let sig = auth::expected_hit_signature(ts, &id, "12345");
        let uri = format!("/h/{}/keystamp={ts}-{sig}/x.png", id.textual());

        let app = router(Arc::clone(&state));
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn keystamp_mismatch_is_forbidden() {
        let (state, _dir) = build_state().await;

        let data = vec![7u8; 42];
        let mut hasher = sha1::Sha1::new();
        use sha1::Digest;
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();
        let id = FileId::new(hash, FileType::Png, 42, 1920, 1080).unwrap();

        let mut reader = std::io::Cursor::new(data);
        state.frontend.add(&id, &mut reader).await.unwrap();
        state.metadb.add(&id).await.unwrap();

        let uri = format!("/h/{}/keystamp=10666-deadbeef01/x.png", id.textual());
        let app = router(Arc::clone(&state));
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn signed_still_alive_servercmd_succeeds() {
        let (state, _dir) = build_state().await;
        let now = 1_000_000i64;
        let sig = auth::expected_servercmd_signature("still_alive", "", 1345, now, "12345");
        let uri = format!("/servercmd/still_alive/-/{now}/{sig}");
        let app = router(Arc::clone(&state));
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut().insert(axum::extract::ConnectInfo(
            std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
        ));
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn robots_txt_serves_disallow_all() {
        let (state, _dir) = build_state().await;
        let app = router(Arc::clone(&state));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/robots.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
