use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::instrument;

use crate::fileid::{FileId, FileType};

use super::{BULK_SIZE, MetaDb, MetaDbError};

/// SQLite-backed [`MetaDb`]. Single-writer batched transactions; readers may
/// proceed concurrently against committed state (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct SqliteMetaDb {
    pool: SqlitePool,
}

impl SqliteMetaDb {
    /// Opens (creating if absent) the metadata database at `db_path`, runs
    /// migrations, and configures WAL mode with a 1-second busy timeout
    /// (spec.md §5's lock-acquisition timeout).
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, MetaDbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&db_url).await?;
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=1000").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            MetaDbError::Db(sqlx::Error::Configuration(e.to_string().into()))
        })?;
        Ok(Self { pool })
    }

    /// In-memory database, for tests.
    pub async fn open_in_memory() -> Result<Self, MetaDbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            MetaDbError::Db(sqlx::Error::Configuration(e.to_string().into()))
        })?;
        Ok(Self { pool })
    }
}

fn file_type_to_db(t: FileType) -> i64 {
    match t {
        FileType::Jpg => 0,
        FileType::Png => 1,
        FileType::Gif => 2,
        FileType::Unknown => 255,
    }
}

fn file_type_from_db(v: i64) -> FileType {
    match v {
        0 => FileType::Jpg,
        1 => FileType::Png,
        2 => FileType::Gif,
        _ => FileType::Unknown,
    }
}

fn row_to_file_id(row: &SqliteRow) -> Result<FileId, MetaDbError> {
    let hash_vec: Vec<u8> = row.try_get("hash")?;
    let mut hash = [0u8; 20];
    if hash_vec.len() != 20 {
        return Err(MetaDbError::Inconsistent("hash column is not 20 bytes".into()));
    }
    hash.copy_from_slice(&hash_vec);
    let file_type: i64 = row.try_get("file_type")?;
    let is_static: i64 = row.try_get("is_static")?;
    let size: i64 = row.try_get("size")?;
    let width: i64 = row.try_get("width")?;
    let height: i64 = row.try_get("height")?;
    let last_usage: i64 = row.try_get("last_usage")?;
    Ok(FileId {
        hash,
        file_type: file_type_from_db(file_type),
        size: size as u64,
        width: width as u16,
        height: height as u16,
        is_static: is_static != 0,
        last_usage,
    })
}

async fn insert_one(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    f: &FileId,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO files (hash, file_type, is_static, size, width, height, last_usage)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(f.hash.to_vec())
    .bind(file_type_to_db(f.file_type))
    .bind(i64::from(f.is_static))
    .bind(f.size as i64)
    .bind(i64::from(f.width))
    .bind(i64::from(f.height))
    .bind(f.last_usage)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl MetaDb for SqliteMetaDb {
    #[instrument(skip(self, f), fields(id = %f.textual()))]
    async fn add(&self, f: &FileId) -> Result<(), MetaDbError> {
        insert_one(&self.pool, f).await?;
        Ok(())
    }

    #[instrument(skip(self, fs), fields(count = fs.len()))]
    async fn add_batch(&self, fs: &[FileId]) -> Result<(), MetaDbError> {
        for chunk in fs.chunks(BULK_SIZE) {
            let mut tx = self.pool.begin().await?;
            for f in chunk {
                insert_one(&mut *tx, f).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, hash: &[u8; 20]) -> Result<FileId, MetaDbError> {
        let row = sqlx::query("SELECT * FROM files WHERE hash = ?")
            .bind(hash.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_file_id(&row),
            None => Err(MetaDbError::NotFound),
        }
    }

    #[instrument(skip(self, f), fields(id = %f.textual()))]
    async fn exists(&self, f: &FileId) -> Result<bool, MetaDbError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM files WHERE hash = ?")
            .bind(f.hash.to_vec())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, f), fields(id = %f.textual()))]
    async fn remove(&self, f: &FileId) -> Result<(), MetaDbError> {
        sqlx::query("DELETE FROM files WHERE hash = ?")
            .bind(f.hash.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, fs), fields(count = fs.len()))]
    async fn remove_batch(&self, fs: &[FileId]) -> Result<(), MetaDbError> {
        for chunk in fs.chunks(BULK_SIZE) {
            let mut tx = self.pool.begin().await?;
            for f in chunk {
                sqlx::query("DELETE FROM files WHERE hash = ?")
                    .bind(f.hash.to_vec())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, f), fields(id = %f.textual()))]
    async fn use_one(&self, f: &FileId) -> Result<(), MetaDbError> {
        // Read-then-update per spec.md §9's resolved open question: fetch the
        // durable record first so we never clobber fields from a stale copy.
        let existing = self.get(&f.hash).await?;
        let now = now_unix();
        let mut updated = existing;
        updated.last_usage = now;
        insert_one(&self.pool, &updated).await?;
        Ok(())
    }

    #[instrument(skip(self, fs), fields(count = fs.len()))]
    async fn use_batch(&self, fs: &[FileId]) -> Result<(), MetaDbError> {
        let now = now_unix();
        for chunk in fs.chunks(BULK_SIZE) {
            let mut tx = self.pool.begin().await?;
            for f in chunk {
                let row = sqlx::query("SELECT * FROM files WHERE hash = ?")
                    .bind(f.hash.to_vec())
                    .fetch_optional(&mut *tx)
                    .await?;
                let Some(row) = row else {
                    return Err(MetaDbError::NotFound);
                };
                let mut existing = row_to_file_id(&row)?;
                existing.last_usage = now;
                insert_one(&mut *tx, &existing).await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_old_files(&self, max: u64, deadline: i64) -> Result<Vec<FileId>, MetaDbError> {
        let limit: i64 = if max == 0 { i64::MAX } else { max as i64 };
        let rows = sqlx::query(
            "SELECT * FROM files WHERE last_usage <= ? ORDER BY last_usage ASC, hash ASC LIMIT ?",
        )
        .bind(deadline)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_file_id).collect()
    }

    #[instrument(skip(self))]
    async fn get_old_files_count(&self, deadline: i64) -> Result<i64, MetaDbError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM files WHERE last_usage <= ?")
                .bind(deadline)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    #[instrument(skip(self, out))]
    async fn get_batch(&self, out: mpsc::Sender<FileId>, max: u64) -> Result<(), MetaDbError> {
        let limit: i64 = if max == 0 { i64::MAX } else { max as i64 };
        let rows = sqlx::query("SELECT * FROM files LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let id = row_to_file_id(row)?;
            if out.send(id).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn count(&self) -> Result<i64, MetaDbError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn size(&self) -> Result<i64, MetaDbError> {
        let (sum,): (Option<i64>,) = sqlx::query_as("SELECT SUM(size) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(sum.unwrap_or(0))
    }
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
    use crate::fileid::FileType;

    fn make(hash_byte: u8, last_usage: i64) -> FileId {
        let mut hash = [0u8; 20];
        hash[0] = hash_byte;
        FileId {
            hash,
            file_type: FileType::Png,
            size: 10,
            width: 1,
            height: 1,
            is_static: false,
            last_usage,
        }
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let db = SqliteMetaDb::open_in_memory().await.unwrap();
        let f = make(1, 1000);
        db.add(&f).await.unwrap();
        let got = db.get(&f.hash).await.unwrap();
        assert_eq!(got, f);
        assert!(db.exists(&f).await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let db = SqliteMetaDb::open_in_memory().await.unwrap();
        let f = make(9, 1);
        assert!(matches!(db.get(&f.hash).await, Err(MetaDbError::NotFound)));
    }

    #[tokio::test]
    async fn add_batch_splits_large_batches_and_preserves_count() {
        let db = SqliteMetaDb::open_in_memory().await.unwrap();
        let files: Vec<FileId> = (0..(BULK_SIZE + 50))
            .map(|i| {
                let mut hash = [0u8; 20];
                hash[0..8].copy_from_slice(&(i as u64).to_be_bytes());
                FileId {
                    hash,
                    file_type: FileType::Jpg,
                    size: 1,
                    width: 1,
                    height: 1,
                    is_static: false,
                    last_usage: 0,
                }
            })
            .collect();
        db.add_batch(&files).await.unwrap();
        assert_eq!(db.count().await.unwrap(), files.len() as i64);
    }

    #[tokio::test]
    async fn eviction_round_trip_matches_spec_scenario() {
        let db = SqliteMetaDb::open_in_memory().await.unwrap();
        let now = 1_000_000i64;
        let mut old_batch = Vec::new();
        for i in 0..100u8 {
            old_batch.push(make(i, now - 5));
        }
        let mut newer_batch = Vec::new();
        for i in 100..200u8 {
            newer_batch.push(make(i, now - 1));
        }
        db.add_batch(&old_batch).await.unwrap();
        db.add_batch(&newer_batch).await.unwrap();

        assert_eq!(db.get_old_files_count(now - 4).await.unwrap(), 100);
        let old = db.get_old_files(0, now - 4).await.unwrap();
        assert_eq!(old.len(), 100);
        for f in &old {
            assert!(f.last_usage <= now - 4);
        }
        db.remove_batch(&old).await.unwrap();
        assert_eq!(db.count().await.unwrap(), 100);
        assert_eq!(db.get_old_files_count(now - 4).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn use_one_bumps_last_usage() {
        let db = SqliteMetaDb::open_in_memory().await.unwrap();
        let f = make(5, 100);
        db.add(&f).await.unwrap();
        db.use_one(&f).await.unwrap();
        let got = db.get(&f.hash).await.unwrap();
        assert!(got.last_usage >= now_unix() - 2);
    }

    #[tokio::test]
    async fn size_sums_file_sizes() {
        let db = SqliteMetaDb::open_in_memory().await.unwrap();
        db.add(&make(1, 0)).await.unwrap();
        db.add(&make(2, 0)).await.unwrap();
        assert_eq!(db.size().await.unwrap(), 20);
    }
}
