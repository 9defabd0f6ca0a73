//! Reference-counted SQLite handle for the request cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::storage::error::{StorageError, StorageResult};
use crate::sync::lock;

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Database shared by every cache user.
///
/// The connection is opened by the first [`open`](Self::open) and closed when
/// the last [`CacheLease`] is dropped.
pub struct CacheDatabase {
    location: Location,
    open_count: AtomicUsize,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for CacheDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDatabase")
            .field("location", &self.location)
            .field("open_count", &self.open_count())
            .finish_non_exhaustive()
    }
}

impl CacheDatabase {
    /// Database stored at `path`. Nothing is opened yet.
    pub fn new(path: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self::with_location(Location::File(path.as_ref().to_path_buf())))
    }

    /// In-memory database. Its contents are lost once the last lease closes.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::with_location(Location::Memory))
    }

    fn with_location(location: Location) -> Self {
        Self { location, open_count: AtomicUsize::new(0), conn: Mutex::new(None) }
    }

    /// Take a lease, opening the connection if this is the first one.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database cannot be opened or its
    ///   schema created
    pub fn open(self: &Arc<Self>) -> StorageResult<CacheLease> {
        let mut conn = lock(&self.conn);
        if conn.is_none() {
            let opened = match &self.location {
                Location::File(path) => Connection::open(path)?,
                Location::Memory => Connection::open_in_memory()?,
            };
            init_schema(&opened)?;
            info!(location = ?self.location, "Request cache opened");
            *conn = Some(opened);
        }
        self.open_count.fetch_add(1, Ordering::AcqRel);
        Ok(CacheLease { db: Arc::clone(self) })
    }

    /// Number of outstanding leases.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    /// Whether a connection is currently open.
    pub fn is_open(&self) -> bool {
        lock(&self.conn).is_some()
    }

    fn release(&self) {
        let mut conn = lock(&self.conn);
        if self.open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            *conn = None;
            debug!("Request cache closed");
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let conn = lock(&self.conn);
        let conn = conn.as_ref().ok_or(StorageError::Closed)?;
        f(conn)
    }
}

/// Keeps the cache database open while alive.
pub struct CacheLease {
    db: Arc<CacheDatabase>,
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease").finish_non_exhaustive()
    }
}

impl CacheLease {
    /// Run `f` against the open connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        self.db.with_connection(f)
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.db.release();
    }
}

fn init_schema(conn: &Connection) -> StorageResult<()> {
    debug!("Initializing request cache schema");
    conn.execute(
        r"
        CREATE TABLE IF NOT EXISTS cache (
            request_endpoint TEXT,
            request_payload TEXT,
            request_id TEXT,
            request_date INTEGER,
            retry_count INTEGER
        )
        ",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_is_reference_counted() {
        let db = CacheDatabase::in_memory();
        assert!(!db.is_open());

        let first = db.open().unwrap();
        let second = db.open().unwrap();
        assert_eq!(db.open_count(), 2);
        assert!(db.is_open());

        drop(first);
        assert!(db.is_open());
        drop(second);
        assert_eq!(db.open_count(), 0);
        assert!(!db.is_open());
    }

    #[test]
    fn test_schema_created() {
        let db = CacheDatabase::in_memory();
        let lease = db.open().unwrap();
        let columns: Vec<String> = lease
            .with_connection(|conn| {
                let mut stmt = conn.prepare("PRAGMA table_info(cache)")?;
                let names = stmt.query_map([], |row| row.get::<_, String>(1))?.collect::<Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .unwrap();
        assert_eq!(columns, vec!["request_endpoint", "request_payload", "request_id", "request_date", "retry_count"]);
    }

    #[test]
    fn test_file_database_survives_close() {
        let dir = TempDir::new().unwrap();
        let db = CacheDatabase::new(dir.path().join("teak.db"));
        {
            let lease = db.open().unwrap();
            lease
                .with_connection(|conn| {
                    conn.execute("INSERT INTO cache (request_id, retry_count) VALUES ('r1', 0)", [])?;
                    Ok(())
                })
                .unwrap();
        }
        assert!(!db.is_open());

        let lease = db.open().unwrap();
        let count: i64 = lease
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_failure() {
        let dir = TempDir::new().unwrap();
        let db = CacheDatabase::new(dir.path().join("missing").join("teak.db"));
        assert!(matches!(db.open(), Err(StorageError::Connection(_))));
        assert_eq!(db.open_count(), 0);
    }
}
