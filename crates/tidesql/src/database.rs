//! The per-file entry point applications hold on to.

use crate::configs::{BackupConfig, CheckpointConfig};
use crate::notifier::{ErrorEvent, MigrationEvent};
use crate::queue::{backup, corruption};
use crate::registry::Core;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tidesql_core::error::{ConfigError, MigrationErrorKind};
use tidesql_core::sql::{StatementKind, analyze};
use tidesql_core::{Error, Result, Row, Value};
use tidesql_migration::{
    MigrationBaseInfo, MigrationConfig, MigrationEngine, MigrationInfo, MigrationProgress,
    MigrationSettings, MigrationSlot, StepReport,
};
use tidesql_pool::{InnerDatabase, Intent, PoolStats, RecyclableHandle};
use tidesql_sqlite::{CheckpointMode, CheckpointResult, Config, Handle, Priority};

/// Everything shared by the [`Database`] values of one file.
pub(crate) struct DatabaseState {
    pub(crate) inner: Arc<InnerDatabase>,
    migration: Arc<MigrationSlot>,
    /// Also serializes creation of the engine.
    migration_settings: Mutex<MigrationSettings>,
    auto_migrate: AtomicBool,
}

impl DatabaseState {
    /// Every handle of the file gets the migration slot as its rewriter,
    /// whether or not a migration is ever registered.
    pub(crate) fn new(inner: Arc<InnerDatabase>) -> Self {
        let migration = Arc::new(MigrationSlot::new());
        let config: Arc<dyn Config> = Arc::new(MigrationConfig::with_slot(Arc::clone(&migration)));
        inner.update_configs(|configs| {
            configs.with(MigrationConfig::NAME, config, Priority::DEFAULT)
        });
        Self {
            inner,
            migration,
            migration_settings: Mutex::new(MigrationSettings::default()),
            auto_migrate: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_auto_migrate(&self) -> bool {
        self.auto_migrate.load(Ordering::Acquire)
    }

    pub(crate) fn is_auto_backup(&self) -> bool {
        self.inner.configs().contains(BackupConfig::NAME)
    }

    fn engine(&self) -> Option<Arc<MigrationEngine>> {
        self.migration.engine()
    }
}

/// A database file.
///
/// Cloning is cheap, and every `Database` for the same path (through the
/// same [`Core`]) shares one handle pool, one config pipeline and one
/// migration engine. The file is opened lazily on first use.
///
/// # Example
///
/// ```rust,ignore
/// use tidesql::{Database, Value};
///
/// let db = Database::new("app.db");
/// db.execute("CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT)")?;
/// db.execute_with("INSERT INTO notes (body) VALUES (?1)", &[Value::from("hello")])?;
/// let rows = db.query("SELECT body FROM notes", &[])?;
/// ```
#[derive(Clone)]
pub struct Database {
    core: Arc<Core>,
    state: Arc<DatabaseState>,
}

impl Database {
    /// The database at `path` on the process-wide core.
    pub fn new(path: &str) -> Self {
        Core::shared().database(path)
    }

    /// The database at `path` on a specific core.
    pub fn with_core(core: &Arc<Core>, path: &str) -> Self {
        core.database(path)
    }

    pub(crate) fn from_state(core: Arc<Core>, state: Arc<DatabaseState>) -> Self {
        Self { core, state }
    }

    /// Normalized path every handle of this database opens.
    pub fn path(&self) -> &str {
        self.state.inner.path()
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Whether a handle can be opened and configured right now.
    pub fn can_open(&self) -> bool {
        self.handle(Intent::Read).is_ok()
    }

    /// True while any handle (idle or leased) is open.
    pub fn is_opened(&self) -> bool {
        self.state.inner.is_opened()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.inner.stats()
    }

    /// Close idle handles; leased ones close when they come back.
    pub fn purge(&self) {
        self.state.inner.purge();
    }

    /// Wait for every lease to return, close all handles and run `f` while
    /// no handle can be opened.
    pub fn close<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.state.inner.close(f)
    }

    /// Lease a handle. Drop it (and every clone) to give it back.
    pub fn handle(&self, intent: Intent) -> Result<RecyclableHandle> {
        self.state.inner.acquire(intent)
    }

    /// Lease a handle for the duration of `f`.
    pub fn with_handle<R>(&self, intent: Intent, f: impl FnOnce(&Handle) -> Result<R>) -> Result<R> {
        let handle = self.handle(intent)?;
        f(&handle)
    }

    /// Run one statement without parameters.
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.handle(intent_of(sql))?.execute(sql)
    }

    /// Run one statement and return the number of rows it changed.
    pub fn execute_with(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.handle(intent_of(sql))?.execute_with(sql, params)
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.handle(intent_of(sql))?.query(sql, params)
    }

    pub fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        self.handle(intent_of(sql))?.query_one(sql, params)
    }

    pub fn query_value(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        self.handle(intent_of(sql))?.query_value(sql, params)
    }

    /// Run `f` inside a write transaction; it commits when `f` returns
    /// `Ok(true)` and rolls back otherwise.
    pub fn run_transaction<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&Handle) -> Result<bool>,
    {
        self.handle(Intent::Write)?.run_transaction(f)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.handle(Intent::Read)?.table_exists(table)
    }

    /// Register `config` under `name`. Handles opened from now on run it in
    /// `priority` order; idle handles are brought up to date when next
    /// leased.
    pub fn set_config(&self, name: &str, config: Arc<dyn Config>, priority: Priority) {
        self.state
            .inner
            .update_configs(|configs| configs.with(name, config, priority));
    }

    pub fn remove_config(&self, name: &str) {
        self.state.inner.update_configs(|configs| configs.without(name));
    }

    pub fn config_names(&self) -> Vec<String> {
        self.state
            .inner
            .configs()
            .names()
            .map(str::to_string)
            .collect()
    }

    /// Settings for the migration engine, which is created by the first
    /// [`add_migration`](Self::add_migration).
    pub fn set_migration_settings(&self, settings: MigrationSettings) -> Result<()> {
        let mut current = self
            .state
            .migration_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state.engine().is_some() {
            return Err(Error::Config(ConfigError {
                name: Some(MigrationConfig::NAME.to_string()),
                message: "migration settings are fixed once a migration is registered".to_string(),
                source: None,
            }));
        }
        *current = settings;
        Ok(())
    }

    fn migration_engine(&self) -> Arc<MigrationEngine> {
        let settings = self
            .state
            .migration_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = self.state.engine() {
            return engine;
        }
        let engine = Arc::new(MigrationEngine::new(settings.clone()));
        self.state.migration.install(Arc::clone(&engine));
        engine
    }

    /// Start migrating `base.source_table` into `base.table`. From now on
    /// statements naming the table see the rows of both.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %self.path(), table = %base.table))]
    pub fn add_migration(&self, base: MigrationBaseInfo) -> Result<Arc<MigrationInfo>> {
        let engine = self.migration_engine();
        let info = {
            let handle = self.handle(Intent::Exclusive)?;
            engine.register(&handle, base)?
        };
        if self.state.is_auto_migrate() {
            self.schedule_migration();
        }
        Ok(info)
    }

    /// Move one batch of whichever migration is next in turn. `Ok(None)`
    /// when nothing is left to move.
    pub fn step_migration(&self) -> Result<Option<StepReport>> {
        let Some(engine) = self.state.engine() else {
            return Ok(None);
        };
        if !engine.has_runnable() {
            return Ok(None);
        }
        let stepped = {
            let handle = self.handle(Intent::Exclusive)?;
            engine.step(&handle)
        };
        match stepped {
            Ok(Some(report)) => {
                self.core.notifier().migration().dispatch(&MigrationEvent {
                    path: self.path().to_string(),
                    table: report.table.clone(),
                    rows: report.rows,
                    done: report.done,
                });
                Ok(Some(report))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                if matches!(&err, Error::Migration(e) if e.kind == MigrationErrorKind::Paused) {
                    tracing::warn!(path = %self.path(), error = %err, "migration paused");
                    self.core
                        .notifier()
                        .error()
                        .dispatch(&ErrorEvent::background(self.path(), "migration", &err));
                }
                Err(err)
            }
        }
    }

    /// True once every registered migration has finished (or none exist).
    pub fn is_migrated(&self) -> bool {
        self.state.engine().is_none_or(|engine| engine.is_done())
    }

    pub(crate) fn has_runnable_migration(&self) -> bool {
        self.state.engine().is_some_and(|engine| engine.has_runnable())
    }

    pub fn migration_progress(&self) -> Vec<MigrationProgress> {
        self.state
            .engine()
            .map(|engine| engine.progress())
            .unwrap_or_default()
    }

    /// Let a paused migration continue. Returns `false` if `table` was not
    /// paused.
    pub fn resume_migration(&self, table: &str) -> bool {
        let resumed = self
            .state
            .engine()
            .is_some_and(|engine| engine.resume(table));
        if resumed && self.state.is_auto_migrate() {
            self.schedule_migration();
        }
        resumed
    }

    /// Move batches on the core's migration queue until every migration is
    /// done.
    pub fn enable_auto_migration(&self, enable: bool) {
        self.state.auto_migrate.store(enable, Ordering::Release);
        if enable {
            self.schedule_migration();
        } else {
            self.core.migration_queue().remove(self.path());
        }
    }

    fn schedule_migration(&self) {
        self.core
            .migration_queue()
            .put(self.path(), self.core.config().migration.delay);
    }

    /// Where [`backup`](Self::backup) writes.
    pub fn backup_path(&self) -> PathBuf {
        backup::backup_path(self.path())
    }

    /// Copy the database to [`backup_path`](Self::backup_path) now.
    pub fn backup(&self) -> Result<PathBuf> {
        backup::backup(&self.state.inner)
    }

    /// Back the database up periodically on the core's backup queue.
    pub fn enable_auto_backup(&self, enable: bool) {
        if enable {
            self.set_config(
                BackupConfig::NAME,
                Arc::new(BackupConfig::new(&self.core)),
                Priority::LOWER,
            );
            if backup::is_backed_by_file(self.path()) {
                self.core
                    .backup_queue()
                    .offer(self.path(), self.core.config().backup.delay);
            }
        } else {
            self.remove_config(BackupConfig::NAME);
            self.core.backup_queue().remove(self.path());
        }
    }

    pub fn is_auto_backup(&self) -> bool {
        self.state.is_auto_backup()
    }

    /// Checkpoint the WAL now.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        self.handle(Intent::Read)?.checkpoint(mode)
    }

    /// Leave WAL checkpoints to the core's checkpoint queue (the default) or
    /// to SQLite's built-in auto-checkpoint.
    pub fn enable_auto_checkpoint(&self, enable: bool) {
        if enable {
            self.set_config(
                CheckpointConfig::NAME,
                Arc::new(CheckpointConfig::new(&self.core)),
                Priority::LOW,
            );
        } else {
            self.remove_config(CheckpointConfig::NAME);
            self.core.checkpoint_queue().remove(self.path());
        }
    }

    pub fn vacuum(&self) -> Result<()> {
        self.handle(Intent::Exclusive)?.vacuum()
    }

    /// Run `PRAGMA quick_check`. A failing check hands the database to the
    /// corruption queue for repair.
    pub fn check_integrity(&self) -> Result<bool> {
        let problem = corruption::quick_check(&self.state.inner)?;
        if let Some(message) = &problem {
            tracing::warn!(path = %self.path(), message = %message, "integrity check failed");
            self.core.report_corruption(self.path());
        }
        Ok(problem.is_none())
    }

    /// Close every handle and delete the database with its sidecars and
    /// backup.
    pub fn remove_files(&self) -> Result<()> {
        let path = self.path().to_string();
        self.close(|| -> Result<()> {
            for suffix in ["", "-wal", "-shm", "-journal", ".bak", ".bak.tmp"] {
                match std::fs::remove_file(format!("{path}{suffix}")) {
                    Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                        return Err(err.into());
                    }
                    _ => {}
                }
            }
            Ok(())
        })?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Lease needed to run `sql`: schema changes exclude every writer, other
/// statements that may write take a write lease.
fn intent_of(sql: &str) -> Intent {
    match analyze(sql).kind {
        StatementKind::Select => Intent::Read,
        StatementKind::Schema => Intent::Exclusive,
        _ => Intent::Write,
    }
}
