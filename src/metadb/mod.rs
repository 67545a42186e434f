//! Durable mapping hash -> [`FileId`] plus a secondary ordered index on
//! `(last_usage, hash)`.
//!
//! [`MetaDb`] is the trait [`crate::serve`] depends on; [`sqlite::SqliteMetaDb`]
//! is the only implementation, backed by `sqlx`/SQLite (the teacher's
//! persistence crate).

mod sqlite;

pub use sqlite::SqliteMetaDb;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::fileid::FileId;

/// A batch larger than this is split into sub-batches by [`MetaDb::add_batch`].
pub const BULK_SIZE: usize = 10_000;

/// Errors raised by [`MetaDb`] operations.
#[derive(Debug, Error)]
pub enum MetaDbError {
    #[error("record not found")]
    NotFound,
    #[error("secondary index referenced a record no longer in the primary store: {0}")]
    Inconsistent(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Metadata database capability the serving layer and eviction loop depend on.
#[async_trait]
pub trait MetaDb: Send + Sync {
    async fn add(&self, f: &FileId) -> Result<(), MetaDbError>;
    async fn add_batch(&self, fs: &[FileId]) -> Result<(), MetaDbError>;
    async fn get(&self, hash: &[u8; 20]) -> Result<FileId, MetaDbError>;
    async fn exists(&self, f: &FileId) -> Result<bool, MetaDbError>;
    async fn remove(&self, f: &FileId) -> Result<(), MetaDbError>;
    async fn remove_batch(&self, fs: &[FileId]) -> Result<(), MetaDbError>;
    /// Bumps `last_usage` to now. Read-then-update: the stored record is
    /// fetched first so the write reflects the durable state, not whatever
    /// stale copy the caller is holding.
    async fn use_one(&self, f: &FileId) -> Result<(), MetaDbError>;
    async fn use_batch(&self, fs: &[FileId]) -> Result<(), MetaDbError>;
    /// Range-scans the secondary index for `last_usage <= deadline`, in
    /// `(last_usage, hash)` order. `max == 0` means unbounded.
    async fn get_old_files(&self, max: u64, deadline: i64) -> Result<Vec<FileId>, MetaDbError>;
    async fn get_old_files_count(&self, deadline: i64) -> Result<i64, MetaDbError>;
    /// Streams the entire primary store through `out`. `max == 0` means unbounded.
    async fn get_batch(&self, out: mpsc::Sender<FileId>, max: u64) -> Result<(), MetaDbError>;
    async fn count(&self) -> Result<i64, MetaDbError>;
    async fn size(&self) -> Result<i64, MetaDbError>;
}
