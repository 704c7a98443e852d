// Per-partition SQLite index
use crate::error::TrackerResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileRecord {
    pub hash: String,
    pub shard: u32,
    pub timestamp: i64,
    pub metahash: Option<String>,
    pub metadata: Option<Vec<u8>>,
}

/// Listing row: a record without its metadata blob.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileTrackerItem {
    pub hash: String,
    pub shard: u32,
    pub timestamp: i64,
    pub metahash: Option<String>,
}

/// The index and blob directory of a single disk partition.
///
/// Writers take `writer` for the whole read-check-write sequence of a commit;
/// readers go straight to the pool and see a WAL snapshot.
pub struct PartitionStore {
    index: usize,
    dir: PathBuf,
    pool: Pool<Sqlite>,
    writer: Mutex<()>,
}

impl PartitionStore {
    /// Create the partition directory if needed, open its index and make sure
    /// the schema exists.
    pub async fn open(dir: PathBuf, index: usize, max_connections: u32) -> TrackerResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let opts = SqliteConnectOptions::new()
            .filename(index_file(&dir, index))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self {
            index,
            dir,
            pool,
            writer: Mutex::new(()),
        };
        if let Err(e) = store.init_schema().await {
            store.close().await;
            return Err(e);
        }

        tracing::debug!(partition = index, dir = %store.dir.display(), "Opened partition");
        Ok(store)
    }

    /// Check-then-create inside one transaction so a concurrent first opener
    /// cannot create the table twice.
    async fn init_schema(&self) -> TrackerResult<()> {
        let mut tx = self.pool.begin().await?;

        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'files')",
        )
        .fetch_one(&mut *tx)
        .await?;

        if !table_exists {
            sqlx::query(
                r#"
                CREATE TABLE files (
                    hash TEXT NOT NULL,
                    shard INTEGER NOT NULL,
                    timestamp INTEGER NOT NULL,
                    metahash TEXT, -- NULLable because not everyone stores the metadata
                    metadata BLOB,
                    CONSTRAINT ix_files_hash_shard PRIMARY KEY (hash, shard)
                )
                "#,
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "CREATE INDEX ix_files_hash_shard_timestamp ON files (hash, shard, timestamp)",
            )
            .execute(&mut *tx)
            .await?;

            tracing::info!(partition = self.index, "Created files table");
        }

        tx.commit().await?;
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Take the partition writer lock and open a transaction under it.
    pub async fn begin_write(&self) -> TrackerResult<WriteTxn<'_>> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTxn { tx, _guard: guard })
    }

    /// Current record for `(hash, shard)`, outside any write transaction.
    pub async fn get(&self, hash: &str, shard: u32) -> TrackerResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(SELECT_CURRENT)
            .bind(hash)
            .bind(shard)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Every record with `start <= hash <= stop`.
    pub async fn range(&self, start: &str, stop: &str) -> TrackerResult<Vec<FileTrackerItem>> {
        let items = sqlx::query_as::<_, FileTrackerItem>(
            r#"
            SELECT hash, shard, timestamp, metahash
            FROM files
            WHERE hash BETWEEN ? AND ?
            ORDER BY hash, shard
            "#,
        )
        .bind(start)
        .bind(stop)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const SELECT_CURRENT: &str = r#"
    SELECT hash, shard, timestamp, metahash, metadata
    FROM files
    WHERE hash = ? AND shard = ?
    ORDER BY timestamp DESC
    LIMIT 1
"#;

/// An open write transaction on one partition.
///
/// Dropping it without [`WriteTxn::commit`] rolls the transaction back and
/// then releases the writer lock.
pub struct WriteTxn<'a> {
    tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
}

impl WriteTxn<'_> {
    pub async fn current(&mut self, hash: &str, shard: u32) -> TrackerResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(SELECT_CURRENT)
            .bind(hash)
            .bind(shard)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(record)
    }

    pub async fn insert(&mut self, record: &FileRecord) -> TrackerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files (hash, shard, timestamp, metahash, metadata)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.hash)
        .bind(record.shard)
        .bind(record.timestamp)
        .bind(&record.metahash)
        .bind(&record.metadata)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn update(&mut self, record: &FileRecord) -> TrackerResult<()> {
        sqlx::query(
            r#"
            UPDATE files
            SET timestamp = ?, metahash = ?, metadata = ?
            WHERE hash = ? AND shard = ?
            "#,
        )
        .bind(record.timestamp)
        .bind(&record.metahash)
        .bind(&record.metadata)
        .bind(&record.hash)
        .bind(record.shard)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> TrackerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// `<dir>/filetracker_<pp>.sqlite3`
pub fn index_file(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("filetracker_{:02x}.sqlite3", index))
}
