//! Append-only content store keyed by [`FileId`].
//!
//! Bodies are sharded on disk by the first byte of the hash:
//! `<root>/<hh>/<hex(hash)>-<size>-<w>-<h>-<type>`. `DiskFrontend` is the
//! only implementation; [`Frontend`] exists as a trait so [`crate::serve`]
//! can be built and tested against a fake store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{instrument, warn};

use crate::fileid::FileId;

/// Errors raised by [`Frontend`] operations.
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("copied {copied} bytes, expected {expected}")]
    BadLength { copied: u64, expected: u64 },
    #[error("body hash does not match file id: {0}")]
    Inconsistent(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Progress tick emitted periodically by [`Frontend::scan`].
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub shards_done: usize,
    pub shards_total: usize,
    pub files_found: u64,
}

/// Content store capability the serving layer depends on.
#[async_trait]
pub trait Frontend: Send + Sync {
    /// Copies exactly `id.size` bytes from `reader` into the store.
    async fn add(
        &self,
        id: &FileId,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<(), FrontendError>;

    /// Opens the body for reading; `NotFound` if absent.
    async fn get(&self, id: &FileId) -> Result<tokio::fs::File, FrontendError>;

    /// Recomputes the SHA-1 of the stored body and compares to `id.hash`.
    async fn check(&self, id: &FileId) -> Result<(), FrontendError>;

    /// Unlinks the body. Missing file is treated as success.
    async fn remove(&self, id: &FileId) -> Result<(), FrontendError>;

    /// Best-effort batch remove; individual "missing" is success.
    async fn remove_batch(&self, ids: &[FileId]) -> Result<(), FrontendError>;

    /// Streams the body as an HTTP response: 404 on `NotFound`, 500 on
    /// unexpected I/O error, otherwise a streaming 200.
    async fn handle(&self, id: &FileId) -> Response;

    /// Enumerates every on-disk file, emitting parsed [`FileId`]s onto
    /// `out` and coarse progress onto `progress`.
    async fn scan(
        &self,
        out: mpsc::Sender<FileId>,
        progress: mpsc::Sender<ScanProgress>,
    ) -> Result<(), FrontendError>;
}

/// Disk-backed [`Frontend`] rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct DiskFrontend {
    root: PathBuf,
}

impl DiskFrontend {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn shard_dir(&self, id: &FileId) -> PathBuf {
        self.root.join(id.shard_prefix())
    }

    fn path(&self, id: &FileId) -> PathBuf {
        self.shard_dir(id).join(id.textual())
    }
}

#[async_trait]
impl Frontend for DiskFrontend {
    #[instrument(skip(self, reader), fields(id = %id.textual()))]
    async fn add(
        &self,
        id: &FileId,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<(), FrontendError> {
        let dir = self.shard_dir(id);
        if let Err(e) = fs::create_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(FrontendError::Io(e));
            }
        }
        let path = self.path(id);
        let mut file = fs::File::create(&path).await?;
        let mut buf = [0u8; 64 * 1024];
        let mut copied: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
        file.flush().await?;
        if copied != id.size {
            return Err(FrontendError::BadLength {
                copied,
                expected: id.size,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id.textual()))]
    async fn get(&self, id: &FileId) -> Result<tokio::fs::File, FrontendError> {
        fs::File::open(self.path(id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FrontendError::NotFound(id.textual())
            } else {
                FrontendError::Io(e)
            }
        })
    }

    #[instrument(skip(self), fields(id = %id.textual()))]
    async fn check(&self, id: &FileId) -> Result<(), FrontendError> {
        let mut file = self.get(id).await?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        let mut copied: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            copied += n as u64;
        }
        if copied != id.size {
            return Err(FrontendError::BadLength {
                copied,
                expected: id.size,
            });
        }
        let digest = hasher.finalize();
        if digest.as_slice() != id.hash {
            return Err(FrontendError::Inconsistent(id.textual()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id.textual()))]
    async fn remove(&self, id: &FileId) -> Result<(), FrontendError> {
        match fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FrontendError::Io(e)),
        }
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn remove_batch(&self, ids: &[FileId]) -> Result<(), FrontendError> {
        for id in ids {
            self.remove(id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id.textual()))]
    async fn handle(&self, id: &FileId) -> Response {
        let file = match self.get(id).await {
            Ok(f) => f,
            Err(FrontendError::NotFound(_)) => {
                return (StatusCode::NOT_FOUND, "404: file not found").into_response();
            }
            Err(e) => {
                warn!(error = %e, "unexpected I/O error serving file");
                return (StatusCode::INTERNAL_SERVER_ERROR, "500: internal error")
                    .into_response();
            }
        };
        let expected = id.size;
        let stream = ReaderStream::new(file);
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = StatusCode::OK;
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(expected));
        if let Some(mime) = content_type_for(id) {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
        }
        response
    }

    #[instrument(skip(self, out, progress))]
    async fn scan(
        &self,
        out: mpsc::Sender<FileId>,
        progress: mpsc::Sender<ScanProgress>,
    ) -> Result<(), FrontendError> {
        let mut shard_dirs = Vec::new();
        let mut root_entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = root_entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                shard_dirs.push(entry.path());
            }
        }
        shard_dirs.sort();

        let total = shard_dirs.len();
        let mut found: u64 = 0;
        for (i, shard) in shard_dirs.iter().enumerate() {
            let mut entries = fs::read_dir(shard).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                match FileId::parse(&name) {
                    Ok(id) => {
                        found += 1;
                        if out.send(id).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(file = %name, error = %e, "skipping unparseable file on scan");
                    }
                }
            }
            let _ = progress
                .send(ScanProgress {
                    shards_done: i + 1,
                    shards_total: total,
                    files_found: found,
                })
                .await;
        }
        Ok(())
    }
}

fn content_type_for(id: &FileId) -> Option<&'static str> {
    match id.file_type {
        crate::fileid::FileType::Jpg => Some("image/jpeg"),
        crate::fileid::FileType::Png => Some("image/png"),
        crate::fileid::FileType::Gif => Some("image/gif"),
        crate::fileid::FileType::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileid::FileType;
    use std::io::Cursor;

    fn sample_id(size: u64) -> FileId {
        let data = vec![7u8; size as usize];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        FileId::new(hash, FileType::Png, size, 10, 10).unwrap()
    }

    #[tokio::test]
    async fn add_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fe = DiskFrontend::new(dir.path());
        let id = sample_id(100);
        let data = vec![7u8; 100];
        let mut reader = Cursor::new(data.clone());
        fe.add(&id, &mut reader).await.unwrap();

        let mut file = fe.get(&id).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn add_rejects_short_body() {
        let dir = tempfile::tempdir().unwrap();
        let fe = DiskFrontend::new(dir.path());
        let id = sample_id(100);
        let mut reader = Cursor::new(vec![7u8; 50]);
        let err = fe.add(&id, &mut reader).await.unwrap_err();
        assert!(matches!(err, FrontendError::BadLength { .. }));
    }

    #[tokio::test]
    async fn check_detects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let fe = DiskFrontend::new(dir.path());
        let id = sample_id(10);
        // Write wrong content of the right length directly, bypassing add's own hashing.
        let bad_id = FileId::new(id.hash, id.file_type, 10, id.width, id.height).unwrap();
        let dir_path = fe.shard_dir(&bad_id);
        fs::create_dir_all(&dir_path).await.unwrap();
        fs::write(fe.path(&bad_id), vec![0u8; 10]).await.unwrap();
        let err = fe.check(&bad_id).await.unwrap_err();
        assert!(matches!(err, FrontendError::Inconsistent(_)));
    }

    #[tokio::test]
    async fn get_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fe = DiskFrontend::new(dir.path());
        let id = sample_id(1);
        let err = fe.get(&id).await.unwrap_err();
        assert!(matches!(err, FrontendError::NotFound(_)));
    }

    #[tokio::test]
    async fn remove_of_missing_file_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let fe = DiskFrontend::new(dir.path());
        let id = sample_id(1);
        fe.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn scan_finds_added_files() {
        let dir = tempfile::tempdir().unwrap();
        let fe = DiskFrontend::new(dir.path());
        let id = sample_id(8);
        let mut reader = Cursor::new(vec![7u8; 8]);
        fe.add(&id, &mut reader).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (ptx, _prx) = mpsc::channel(8);
        fe.scan(tx, ptx).await.unwrap();
        let found = rx.recv().await.unwrap();
        assert_eq!(found, id);
    }
}
