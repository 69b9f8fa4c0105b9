//! Handle pooling for TideSQL.
//!
//! Every database path maps to one [`InnerDatabase`] in a [`DatabasePool`].
//! An `InnerDatabase` hands out [`RecyclableHandle`]s: each is a distinct
//! native connection that returns to the idle list when the last clone is
//! dropped. Writers and exclusive work (schema changes, migration batches,
//! repair) are serialized through a lease gate; readers never wait.

mod database;

pub use database::{InnerDatabase, RecyclableHandle};

use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tidesql_sqlite::Configs;

/// What a lease will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Intent {
    Read,
    Write,
    /// Excludes every writer and other exclusive lease.
    Exclusive,
}

/// Handle pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle handles kept open per database
    pub max_idle: usize,
    /// Maximum time to wait for a write or exclusive lease in milliseconds
    pub acquire_timeout_ms: u64,
    /// Busy timeout installed on every handle in milliseconds
    pub busy_timeout_ms: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 4,
            acquire_timeout_ms: 10_000, // 10 seconds
            busy_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given idle limit.
    pub fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            ..Default::default()
        }
    }

    /// Set the idle limit.
    pub fn max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set the engine busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total number of handles (active + idle)
    pub total_handles: usize,
    /// Number of idle handles
    pub idle_handles: usize,
    /// Number of leased handles
    pub active_handles: usize,
    pub readers: usize,
    pub writers: usize,
    pub exclusive: bool,
}

/// Registry of open databases keyed by normalized path.
///
/// Entries are weak: a database lives as long as some caller holds it, and
/// [`get`](DatabasePool::get) never resurrects one.
#[derive(Default)]
pub struct DatabasePool {
    config: PoolConfig,
    databases: Mutex<HashMap<String, Weak<InnerDatabase>>>,
}

impl DatabasePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            databases: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The database at `path`, created with `configs` if nobody holds it.
    pub fn get_or_create(&self, path: &str, configs: impl FnOnce() -> Configs) -> Arc<InnerDatabase> {
        let key = normalize_path(path);
        let mut databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = databases.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        databases.retain(|_, weak| weak.strong_count() > 0);
        let database = Arc::new(InnerDatabase::new(key.clone(), configs(), self.config.clone()));
        databases.insert(key, Arc::downgrade(&database));
        tracing::debug!(path = %database.path(), "registered database");
        database
    }

    /// The database at `path` if somebody still holds it.
    pub fn get(&self, path: &str) -> Option<Arc<InnerDatabase>> {
        let key = normalize_path(path);
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .and_then(Weak::upgrade)
    }

    /// Every live database.
    pub fn databases(&self) -> Vec<Arc<InnerDatabase>> {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Close idle handles of every live database.
    pub fn purge(&self) {
        for database in self.databases() {
            database.purge();
        }
    }
}

/// Absolute form of `path` so different spellings share one database.
/// In-memory and URI names are kept as they are.
pub fn normalize_path(path: &str) -> String {
    if path == ":memory:" || path.starts_with("file:") {
        return path.to_string();
    }
    let absolute = std::path::absolute(Path::new(path))
        .unwrap_or_else(|_| Path::new(path).to_path_buf());
    if let Ok(canonical) = absolute.canonicalize() {
        return canonical.to_string_lossy().into_owned();
    }
    // Not created yet: resolve the directory so the key matches the one
    // computed after the file exists.
    let resolved = match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map_or_else(|_| absolute.clone(), |parent| parent.join(name)),
        _ => absolute,
    };
    resolved.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};
    use tidesql_core::Error;
    use tidesql_core::error::{BusyKind, ConnectionErrorKind};
    use tidesql_sqlite::{CustomConfig, Handle, Priority};

    fn temp_db() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db").to_string_lossy().into_owned();
        (dir, path)
    }

    fn wal_configs() -> Configs {
        let mut configs = Configs::new();
        configs.insert(
            "basic",
            Arc::new(CustomConfig::new(|h: &Handle| h.execute_raw("PRAGMA journal_mode = WAL"))),
            Priority::HIGHEST,
        );
        configs
    }

    fn fast() -> PoolConfig {
        PoolConfig::default().acquire_timeout(200)
    }

    #[test]
    fn registry_shares_and_forgets() {
        let (_dir, path) = temp_db();
        let pool = DatabasePool::new(fast());
        let a = pool.get_or_create(&path, Configs::new);
        let b = pool.get_or_create(&path, || panic!("must reuse"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool.get(&path).is_some());
        drop(a);
        drop(b);
        assert!(pool.get(&path).is_none());
    }

    #[test]
    fn release_returns_to_idle_without_leaks() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, wal_configs(), fast());
        for _ in 0..50 {
            let handle = db.acquire(Intent::Write).unwrap();
            handle.execute_raw("CREATE TABLE IF NOT EXISTS t (x)").unwrap();
            let clone = handle.clone();
            drop(handle);
            assert_eq!(db.stats().active_handles, 1);
            drop(clone);
        }
        let stats = db.stats();
        assert_eq!(stats.active_handles, 0);
        assert_eq!(stats.total_handles, 1);
        assert_eq!(stats.idle_handles, 1);
    }

    #[test]
    fn idle_list_is_bounded() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, Configs::new(), fast().max_idle(2));
        let leases: Vec<_> = (0..5).map(|_| db.acquire(Intent::Read).unwrap()).collect();
        let ids: std::collections::HashSet<_> = leases.iter().map(|h| h.id()).collect();
        assert_eq!(ids.len(), 5, "each lease is a distinct connection");
        drop(leases);
        assert_eq!(db.stats().idle_handles, 2);
    }

    #[test]
    fn pipeline_runs_once_per_handle() {
        let (_dir, path) = temp_db();
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let mut configs = Configs::new();
        configs.insert(
            "count",
            Arc::new(CustomConfig::new(move |_: &Handle| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
            Priority::DEFAULT,
        );
        let db = InnerDatabase::new(path, configs, fast());
        for _ in 0..10 {
            drop(db.acquire(Intent::Read).unwrap());
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_pipeline_surfaces_connection_error() {
        let (_dir, path) = temp_db();
        let mut configs = Configs::new();
        configs.insert(
            "broken",
            Arc::new(CustomConfig::new(|h: &Handle| h.execute_raw("PRAGMA nonsense("))),
            Priority::DEFAULT,
        );
        let db = InnerDatabase::new(path, configs, fast());
        let err = db.acquire(Intent::Read).unwrap_err();
        assert!(matches!(err, Error::Connection(ref e) if e.kind == ConnectionErrorKind::Configure));
        assert_eq!(db.stats(), PoolStats::default());
    }

    #[test]
    fn exclusive_waits_for_writers_and_times_out() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, wal_configs(), fast());
        let writer = db.acquire(Intent::Write).unwrap();
        let start = Instant::now();
        let err = db.acquire(Intent::Exclusive).unwrap_err();
        assert!(matches!(err, Error::Busy(ref e) if e.kind == BusyKind::PoolTimeout));
        assert!(start.elapsed() >= Duration::from_millis(150));

        // Readers are never blocked.
        let exclusive_free_read = db.acquire(Intent::Read).unwrap();
        drop(exclusive_free_read);
        drop(writer);
        let exclusive = db.acquire(Intent::Exclusive).unwrap();
        assert!(db.stats().exclusive);
        let reader = db.acquire(Intent::Read).unwrap();
        assert!(db.acquire(Intent::Write).is_err());
        drop(reader);
        drop(exclusive);
        assert!(db.acquire(Intent::Write).is_ok());
    }

    #[test]
    fn exclusive_is_granted_when_writer_leaves() {
        let (_dir, path) = temp_db();
        let db = Arc::new(InnerDatabase::new(
            path,
            wal_configs(),
            PoolConfig::default().acquire_timeout(5_000),
        ));
        let writer = db.acquire(Intent::Write).unwrap();
        let waiter = {
            let db = Arc::clone(&db);
            thread::spawn(move || db.acquire(Intent::Exclusive).map(|h| h.id()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(writer);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn close_blocks_and_reopens() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, wal_configs(), fast());
        drop(db.acquire(Intent::Read).unwrap());
        assert!(db.is_opened());

        let during = db
            .close(|| db.acquire(Intent::Read).map(|_| ()))
            .unwrap();
        assert!(matches!(during, Err(Error::Connection(ref e)) if e.kind == ConnectionErrorKind::Closed));
        assert!(!db.is_opened());
        assert!(db.acquire(Intent::Read).is_ok());
    }

    #[test]
    fn close_times_out_with_outstanding_lease() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, Configs::new(), fast());
        let lease = db.acquire(Intent::Read).unwrap();
        assert!(db.close(|| ()).is_err());
        assert!(!db.is_closing());
        drop(lease);
        assert!(db.close(|| ()).is_ok());
    }

    #[test]
    fn idle_handles_pick_up_config_changes() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, Configs::new(), fast());
        drop(db.acquire(Intent::Read).unwrap());

        db.update_configs(|configs| {
            configs.with(
                "cache",
                Arc::new(CustomConfig::new(|h: &Handle| h.execute_raw("PRAGMA cache_size = 1234"))),
                Priority::DEFAULT,
            )
        });
        let handle = db.acquire(Intent::Read).unwrap();
        let size = handle.query_value("PRAGMA cache_size", &[]).unwrap();
        assert_eq!(size, Some(tidesql_core::Value::Integer(1234)));
        assert_eq!(db.stats().total_handles, 1);
    }

    #[test]
    fn leaked_transaction_is_rolled_back() {
        let (_dir, path) = temp_db();
        let db = InnerDatabase::new(path, wal_configs(), fast());
        {
            let handle = db.acquire(Intent::Write).unwrap();
            handle.execute_raw("CREATE TABLE t (x)").unwrap();
            handle.begin_transaction().unwrap();
            handle.execute_raw("INSERT INTO t VALUES (1)").unwrap();
        }
        let handle = db.acquire(Intent::Read).unwrap();
        assert!(!handle.is_in_transaction());
        let count = handle.query_value("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(count, Some(tidesql_core::Value::Integer(0)));
    }

    #[test]
    fn normalize_keeps_memory_names() {
        assert_eq!(normalize_path(":memory:"), ":memory:");
        assert!(Path::new(&normalize_path("relative.db")).is_absolute());
    }

    #[test]
    fn normalize_is_stable_across_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.db").to_string_lossy().into_owned();
        let before = normalize_path(&path);
        std::fs::write(&path, b"").unwrap();
        assert_eq!(normalize_path(&path), before);
        assert_eq!(normalize_path(&before), before);
    }
}
