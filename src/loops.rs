//! Orchestration loops: usage-batch flusher, register-batch flusher, the
//! eviction sweeper, the coordinator heartbeat, and graceful shutdown
//! (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::coord::Coord;
use crate::fileid::FileId;
use crate::frontend::Frontend;
use crate::metadb::MetaDb;

/// Tick period for the use/register batch flushers.
pub const UPDATE_RATE: Duration = Duration::from_secs(5);
/// Tick period for the eviction sweep.
pub const REMOVE_RATE: Duration = Duration::from_secs(60);
/// Tick period for the coordinator heartbeat.
pub const ALIVE_RATE: Duration = Duration::from_secs(5 * 60);
/// Default retention window before a file becomes eligible for eviction.
pub const REMOVE_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Page size used while draining `getOldFiles` during a sweep.
const EVICTION_PAGE_SIZE: u64 = 1_000;

/// Running handles for the five orchestration loops plus the shared stop
/// signal and channel senders Serve enqueues intents onto.
pub struct Loops {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Loops {
    /// Spawns the use, register, remove, and alive loops. `update_lock` is
    /// the exclusive lock shared between the use-flush and eviction sweep so
    /// the two never interleave on the same `FileID` (spec.md §5).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        frontend: Arc<dyn Frontend>,
        metadb: Arc<dyn MetaDb>,
        coord: Arc<dyn Coord>,
        use_rx: mpsc::Receiver<FileId>,
        register_rx: mpsc::Receiver<FileId>,
        update_lock: Arc<Mutex<()>>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);

        let use_handle = spawn_use_loop(
            Arc::clone(&metadb),
            use_rx,
            Arc::clone(&update_lock),
            stop_rx.clone(),
        );
        let register_handle = spawn_register_loop(Arc::clone(&coord), register_rx, stop_rx.clone());
        let remove_handle = spawn_remove_loop(
            Arc::clone(&frontend),
            Arc::clone(&metadb),
            Arc::clone(&coord),
            update_lock,
            stop_rx.clone(),
        );
        let alive_handle = spawn_alive_loop(coord, stop_rx);

        Self {
            stop,
            handles: vec![use_handle, register_handle, remove_handle, alive_handle],
        }
    }

    /// Signals every loop to stop, then waits for them to drain and exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "orchestration loop panicked during shutdown");
            }
        }
    }
}

async fn drain<T>(rx: &mut mpsc::Receiver<T>, into: &mut Vec<T>) {
    while let Ok(item) = rx.try_recv() {
        into.push(item);
    }
}

#[instrument(skip_all)]
fn spawn_use_loop(
    metadb: Arc<dyn MetaDb>,
    mut rx: mpsc::Receiver<FileId>,
    update_lock: Arc<Mutex<()>>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(UPDATE_RATE);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }

            let mut batch = Vec::new();
            drain(&mut rx, &mut batch).await;
            if !batch.is_empty() {
                let _guard = update_lock.lock().await;
                if let Err(e) = metadb.use_batch(&batch).await {
                    warn!(error = %e, count = batch.len(), "use-batch flush failed");
                }
            }

            if *stop.borrow() {
                break;
            }
        }
    })
}

#[instrument(skip_all)]
fn spawn_register_loop(
    coord: Arc<dyn Coord>,
    mut rx: mpsc::Receiver<FileId>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(UPDATE_RATE);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }

            let mut batch = Vec::new();
            drain(&mut rx, &mut batch).await;
            for chunk in batch.chunks(crate::coord::MAX_IDS_PER_BATCH) {
                if let Err(e) = coord.file_register(chunk).await {
                    warn!(error = %e, count = chunk.len(), "file_register flush failed");
                }
            }

            if *stop.borrow() {
                break;
            }
        }
    })
}

#[instrument(skip_all)]
fn spawn_remove_loop(
    frontend: Arc<dyn Frontend>,
    metadb: Arc<dyn MetaDb>,
    coord: Arc<dyn Coord>,
    update_lock: Arc<Mutex<()>>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REMOVE_RATE);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                break;
            }

            let deadline = now_unix() - REMOVE_TIMEOUT.as_secs() as i64;
            let _guard = update_lock.lock().await;
            loop {
                let batch = match metadb.get_old_files(EVICTION_PAGE_SIZE, deadline).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "eviction scan failed");
                        break;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                if let Err(e) = coord.file_uncache(&batch).await {
                    warn!(error = %e, "eviction file_uncache failed");
                }
                if let Err(e) = metadb.remove_batch(&batch).await {
                    warn!(error = %e, "eviction metadb remove failed");
                }
                if let Err(e) = frontend.remove_batch(&batch).await {
                    warn!(error = %e, "eviction frontend remove failed");
                }
                info!(count = batch.len(), "evicted stale files");
            }
        }
    })
}

#[instrument(skip_all)]
fn spawn_alive_loop(coord: Arc<dyn Coord>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ALIVE_RATE);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                break;
            }
            if let Err(e) = coord.still_alive().await {
                warn!(error = %e, "still_alive heartbeat failed");
            }
        }
    })
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordError;
    use crate::fileid::FileType;
    use crate::frontend::DiskFrontend;
    use crate::metadb::SqliteMetaDb;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCoord {
        uncached: AtomicUsize,
        registered: AtomicUsize,
    }

    #[async_trait]
    impl Coord for CountingCoord {
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
        async fn file_register(&self, ids: &[FileId]) -> Result<(), CoordError> {
            self.registered.fetch_add(ids.len(), Ordering::SeqCst);
            Ok(())
        }
        async fn file_uncache(&self, ids: &[FileId]) -> Result<(), CoordError> {
            self.uncached.fetch_add(ids.len(), Ordering::SeqCst);
            Ok(())
        }
        async fn download_list(
            &self,
            _ids: &[FileId],
        ) -> Result<HashMap<String, String>, CoordError> {
            Ok(HashMap::new())
        }
    }

    fn make(hash_byte: u8, last_usage: i64) -> FileId {
        let mut hash = [0u8; 20];
        hash[0] = hash_byte;
        FileId {
            hash,
            file_type: FileType::Png,
            size: 1,
            width: 1,
            height: 1,
            is_static: false,
            last_usage,
        }
    }

    #[tokio::test]
    async fn eviction_sweep_uncaches_and_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let frontend: Arc<dyn Frontend> = Arc::new(DiskFrontend::new(dir.path()));
        let metadb: Arc<dyn MetaDb> = Arc::new(SqliteMetaDb::open_in_memory().await.unwrap());
        let coord = Arc::new(CountingCoord::default());

        let now = now_unix();
        for i in 0..5u8 {
            metadb.add(&make(i, now - REMOVE_TIMEOUT.as_secs() as i64 - 10)).await.unwrap();
        }
        metadb.add(&make(200, now)).await.unwrap();

        let update_lock = Arc::new(Mutex::new(()));
        let deadline = now - REMOVE_TIMEOUT.as_secs() as i64;
        let stale = metadb.get_old_files(0, deadline).await.unwrap();
        assert_eq!(stale.len(), 5);

        coord.file_uncache(&stale).await.unwrap();
        metadb.remove_batch(&stale).await.unwrap();
        frontend.remove_batch(&stale).await.unwrap();

        assert_eq!(metadb.count().await.unwrap(), 1);
        assert_eq!(coord.uncached.load(Ordering::SeqCst), 5);
        drop(update_lock);
    }

    #[tokio::test]
    async fn loops_shutdown_flushes_pending_use_and_register_batches() {
        let dir = tempfile::tempdir().unwrap();
        let frontend: Arc<dyn Frontend> = Arc::new(DiskFrontend::new(dir.path()));
        let metadb: Arc<dyn MetaDb> = Arc::new(SqliteMetaDb::open_in_memory().await.unwrap());
        let coord = Arc::new(CountingCoord::default());
        let f = make(9, 0);
        metadb.add(&f).await.unwrap();

        let (use_tx, use_rx) = mpsc::channel(100);
        let (register_tx, register_rx) = mpsc::channel(100);
        use_tx.send(f.clone()).await.unwrap();
        register_tx.send(f.clone()).await.unwrap();
        drop(use_tx);
        drop(register_tx);

        let loops = Loops::spawn(
            frontend,
            Arc::clone(&metadb),
            coord.clone(),
            use_rx,
            register_rx,
            Arc::new(Mutex::new(())),
        );
        loops.shutdown().await;

        assert!(coord.registered.load(Ordering::SeqCst) >= 1);
    }
}
