//! Entry point for the cache node binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cachenode::config::FileConfig;
use cachenode::coord::Coord;
use cachenode::serve::BATCH_CHANNEL_CAPACITY;
use cachenode::{AppState, DiskFrontend, HathCoordClient, MetaDb, Settings, SqliteMetaDb};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("cache node starting");

    let file_cfg = match &args.cfg {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("loading config file {}", path.display()))?,
        None => FileConfig::default(),
    };

    let client_id = args
        .client_id
        .or(file_cfg.client_id)
        .context("client id not provided via --client-id or config file")?;
    let client_key = args
        .client_key
        .clone()
        .or(file_cfg.key)
        .context("client key not provided via --client-key or config file")?;

    tokio::fs::create_dir_all(&args.dir)
        .await
        .with_context(|| format!("creating cache root {}", args.dir.display()))?;
    let cache_dir = args.dir.join("cache");
    let db_path = args.dir.join("hath.db");
    tokio::fs::create_dir_all(&cache_dir)
        .await
        .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;

    let frontend: Arc<dyn cachenode::Frontend> = Arc::new(DiskFrontend::new(cache_dir.as_path()));
    let metadb: Arc<dyn MetaDb> = Arc::new(
        SqliteMetaDb::open(&db_path)
            .await
            .with_context(|| format!("opening metadata database {}", db_path.display()))?,
    );
    let coord: Arc<dyn Coord> = Arc::new(
        HathCoordClient::new(client_id, client_key.clone())
            .context("building coordinator client")?,
    );

    coord.client_start().await.context("client_start failed")?;
    coord.client_login().await.context("client_login failed")?;
    let (server_time, min_client_build) =
        coord.check_stats().await.context("check_stats failed")?;
    debug!(server_time, min_client_build, "coordinator reachable");

    let vars = coord
        .client_settings()
        .await
        .context("client_settings failed")?;
    let mut settings = Settings::default().apply_vars(&vars);
    settings.client_id = client_id;
    settings.client_key = client_key;
    settings.check_timestamps = !args.debug;
    settings.check_sha1 = !args.debug;

    if args.scan || metadb.count().await.context("counting existing records")? == 0 {
        info!("running startup reconciliation scan");
        reconcile(&frontend, metadb.as_ref()).await?;
    }

    let (use_tx, use_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
    let (register_tx, register_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);

    let state = Arc::new(AppState::new(
        Arc::clone(&frontend),
        Arc::clone(&metadb),
        Arc::clone(&coord),
        settings,
        reqwest::Client::new(),
        use_tx,
        register_tx,
    ));

    let update_lock = Arc::new(tokio::sync::Mutex::new(()));
    let loops = cachenode::Loops::spawn(
        Arc::clone(&frontend),
        Arc::clone(&metadb),
        Arc::clone(&coord),
        use_rx,
        register_rx,
        update_lock,
    );

    let app = cachenode::router(Arc::clone(&state));
    let addr = format!("0.0.0.0:{}", state.settings.load().port.max(1));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "serving");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shutting down");
    loops.shutdown().await;
    if let Err(e) = coord.client_stop().await {
        warn!(error = %e, "client_stop failed during shutdown");
    }

    Ok(())
}

async fn reconcile(frontend: &Arc<dyn cachenode::Frontend>, metadb: &dyn MetaDb) -> Result<()> {
    let (found_tx, mut found_rx) = mpsc::channel(1024);
    let (progress_tx, mut progress_rx) = mpsc::channel(16);

    let scan_frontend = Arc::clone(frontend);
    let scan_handle =
        tokio::spawn(async move { scan_frontend.scan(found_tx, progress_tx).await });

    let progress_handle = tokio::spawn(async move {
        while let Some(p) = progress_rx.recv().await {
            debug!(
                shards_done = p.shards_done,
                shards_total = p.shards_total,
                files_found = p.files_found,
                "scan progress"
            );
        }
    });

    let mut batch = Vec::new();
    while let Some(id) = found_rx.recv().await {
        batch.push(id);
        if batch.len() >= cachenode::metadb::BULK_SIZE {
            metadb.add_batch(&batch).await.context("reconciling scanned batch")?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        metadb.add_batch(&batch).await.context("reconciling final scanned batch")?;
    }

    scan_handle.await.context("scan task panicked")?.context("scan failed")?;
    progress_handle.await.context("progress task panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
