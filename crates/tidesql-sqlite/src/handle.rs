//! A single SQLite connection with its statement cache, hooks and
//! transaction helpers.
//!
//! A [`Handle`] moves through `Uninitialized -> Active -> Invalidated` and
//! never back. All access to the native connection goes through one mutex;
//! the cancellation flag is polled by the engine's progress handler without
//! taking it.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::hooks::{
    self, ErrorObserver, HookState, PerformanceHook, SqlTraceHook, WalCommitHook,
};
use crate::statement::{HandleStatement, PreparedStatement, StatementRewriter};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString, c_int, c_uint, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tidesql_core::error::{
    BusyError, BusyKind, ConnectionError, ConnectionErrorKind, SqlError, SqlErrorKind,
    TransactionError, TransactionErrorKind,
};
use tidesql_core::{
    CancellationSignal, Error, Result, Row, Statement, Value, quote_ident, quote_literal,
};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Statements beyond this many are finalized instead of cached.
const MAX_CACHED_STATEMENTS: usize = 256;

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Open in multi-thread mode.
    pub no_mutex: bool,
    /// Open in serialized mode.
    pub full_mutex: bool,
    /// Disable shared cache mode.
    pub private_cache: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        if self.private_cache {
            flags |= ffi::SQLITE_OPEN_PRIVATECACHE;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

/// Configuration for opening a handle.
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// Path to the database file, or ":memory:" for in-memory database.
    pub path: String,
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
        }
    }
}

impl HandleConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleState {
    Uninitialized,
    Active,
    Invalidated,
}

/// `sqlite3_wal_checkpoint_v2` modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn code(self) -> c_int {
        match self {
            CheckpointMode::Passive => ffi::SQLITE_CHECKPOINT_PASSIVE,
            CheckpointMode::Full => ffi::SQLITE_CHECKPOINT_FULL,
            CheckpointMode::Restart => ffi::SQLITE_CHECKPOINT_RESTART,
            CheckpointMode::Truncate => ffi::SQLITE_CHECKPOINT_TRUNCATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    /// Frames in the WAL (-1 when not in WAL mode).
    pub log_frames: i32,
    /// Frames copied back into the database.
    pub checkpointed_frames: i32,
}

/// Snapshot of the last error a handle recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub path: String,
    pub tag: Option<String>,
    pub code: Option<i32>,
    pub message: String,
    pub sql: Option<String>,
}

struct HandleInner {
    db: *mut ffi::sqlite3,
    state: HandleState,
    cache: HashMap<String, HandleStatement>,
    cache_generation: u64,
    rewriter: Option<Arc<dyn StatementRewriter>>,
    prerequisites: HashSet<String>,
    last_error: Option<ErrorInfo>,
    composite_changes: Option<i64>,
    savepoint_seq: u64,
}

// SAFETY: the raw connection and cached statements are only touched while
// the owning Handle's mutex is held.
unsafe impl Send for HandleInner {}

impl HandleInner {
    fn ensure_active(&self) -> Result<()> {
        match self.state {
            HandleState::Active => Ok(()),
            HandleState::Uninitialized => Err(Error::misuse("handle is not open")),
            HandleState::Invalidated => Err(Error::invalidated("handle has been invalidated")),
        }
    }

    fn sync_generation(&mut self) -> u64 {
        let generation = self.rewriter.as_ref().map_or(0, |r| r.generation());
        if generation != self.cache_generation {
            self.cache.clear();
            self.cache_generation = generation;
        }
        generation
    }
}

/// One logical connection to a database file.
pub struct Handle {
    inner: Mutex<HandleInner>,
    hooks: Arc<HookState>,
    config: HandleConfig,
    id: u64,
}

impl Handle {
    /// Create an unopened handle.
    pub fn new(config: HandleConfig) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Mutex::new(HandleInner {
                db: ptr::null_mut(),
                state: HandleState::Uninitialized,
                cache: HashMap::new(),
                cache_generation: 0,
                rewriter: None,
                prerequisites: HashSet::new(),
                last_error: None,
                composite_changes: None,
                savepoint_seq: 0,
            }),
            hooks: Arc::new(HookState::new(config.path.clone(), id)),
            config,
            id,
        }
    }

    /// Create and open a handle.
    pub fn open_with(config: HandleConfig) -> Result<Self> {
        let handle = Self::new(config);
        handle.open()?;
        Ok(handle)
    }

    /// Open a private in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open_with(HandleConfig::memory())
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hook_context(&self) -> *mut c_void {
        Arc::as_ptr(&self.hooks) as *mut c_void
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    pub fn state(&self) -> HandleState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Active
    }

    pub fn is_invalidated(&self) -> bool {
        self.state() == HandleState::Invalidated
    }

    pub fn tag(&self) -> Option<String> {
        self.hooks.tag()
    }

    /// Label carried into traces and error reports.
    pub fn set_tag(&self, tag: Option<String>) {
        self.hooks.set_tag(tag);
    }

    /// Open the native connection. Opening an active handle is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            HandleState::Active => return Ok(()),
            HandleState::Invalidated => {
                return Err(Error::invalidated("handle has been invalidated"));
            }
            HandleState::Uninitialized => {}
        }

        let result = self.open_native();
        match result {
            Ok(db) => {
                inner.db = db;
                inner.state = HandleState::Active;
                tracing::debug!(path = %self.config.path, handle = self.id, "opened handle");
                Ok(())
            }
            Err(err) => self.finish(inner, Err(err)),
        }
    }

    fn open_native(&self) -> Result<*mut ffi::sqlite3> {
        let c_path = CString::new(self.config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Open,
                path: self.config.path.clone(),
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = self.config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is valid until closed
                unsafe {
                    let msg = ffi::errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Open,
                path: self.config.path.clone(),
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        // SAFETY: db is valid; the hook state outlives the connection
        unsafe {
            ffi::sqlite3_extended_result_codes(db, 1);
            if self.config.busy_timeout_ms > 0 {
                ffi::sqlite3_busy_timeout(db, self.config.busy_timeout_ms as c_int);
            }
            ffi::sqlite3_progress_handler(
                db,
                hooks::PROGRESS_INTERVAL,
                Some(hooks::progress_callback),
                self.hook_context(),
            );
        }
        Ok(db)
    }

    /// Record a failed result in the error slot, then notify the observer
    /// with the lock released.
    fn finish<T>(&self, mut inner: MutexGuard<'_, HandleInner>, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            inner.last_error = Some(ErrorInfo {
                path: self.config.path.clone(),
                tag: self.hooks.tag(),
                code: err.code(),
                message: err.to_string(),
                sql: err.sql().map(str::to_string),
            });
            drop(inner);
            tracing::debug!(path = %self.config.path, handle = self.id, error = %err, "handle error");
            self.hooks.emit_error(err);
        }
        result
    }

    /// Run `f` against the open connection, recording any error.
    pub(crate) fn with_db<T>(
        &self,
        f: impl FnOnce(*mut ffi::sqlite3, &mut Option<i64>) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.lock();
        inner.ensure_active()?;
        let db = inner.db;
        let result = f(db, &mut inner.composite_changes);
        self.finish(inner, result)
    }

    /// Last error recorded by this handle.
    pub fn error(&self) -> Option<ErrorInfo> {
        self.lock().last_error.clone()
    }

    /// Execute SQL directly, bypassing the rewriter and the statement cache.
    ///
    /// Several `;`-separated statements may be given.
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.with_db(|db, changes| {
            *changes = None;
            exec(db, sql)
        })
    }

    /// Install or remove the statement rewriter. Cached statements are
    /// discarded.
    pub fn set_rewriter(&self, rewriter: Option<Arc<dyn StatementRewriter>>) {
        let mut inner = self.lock();
        inner.rewriter = rewriter;
        inner.cache.clear();
        inner.cache_generation = inner.rewriter.as_ref().map_or(0, |r| r.generation());
    }

    pub fn has_rewriter(&self) -> bool {
        self.lock().rewriter.is_some()
    }

    /// Compile a statement, or check one out of the cache.
    pub fn prepare<S: Statement + ?Sized>(&self, statement: &S) -> Result<PreparedStatement<'_>> {
        let sql = statement.sql();
        let mut inner = self.lock();
        inner.ensure_active()?;
        let generation = inner.sync_generation();
        if let Some(cached) = inner.cache.remove(sql.as_ref()) {
            return Ok(PreparedStatement::new(self, cached, Some(generation)));
        }

        let rewrite = match inner.rewriter.clone() {
            Some(rewriter) if rewriter.is_active() => rewriter.rewrite(&sql, &statement.info()),
            _ => Ok(None),
        };
        let rewrite = match rewrite {
            Ok(rewrite) => rewrite,
            Err(err) => return self.finish(inner, Err(err)),
        };

        if let Some(rewrite) = &rewrite {
            for prerequisite in &rewrite.prerequisites {
                if inner.prerequisites.contains(prerequisite) {
                    continue;
                }
                if let Err(err) = exec(inner.db, prerequisite) {
                    return self.finish(inner, Err(err));
                }
                tracing::trace!(handle = self.id, sql = %prerequisite, "ran rewrite prerequisite");
                inner.prerequisites.insert(prerequisite.clone());
            }
        }

        let compiled = HandleStatement::compile(inner.db, &sql, rewrite);
        match compiled {
            Ok(compiled) => Ok(PreparedStatement::new(self, compiled, Some(generation))),
            Err(err) => self.finish(inner, Err(err)),
        }
    }

    /// Compile `sql` exactly as written: no rewriting, no cache.
    ///
    /// Engine internals use this for statements that address physical tables
    /// which a rewriter would otherwise redirect.
    pub fn prepare_direct(&self, sql: &str) -> Result<PreparedStatement<'_>> {
        let inner = self.lock();
        inner.ensure_active()?;
        match HandleStatement::compile(inner.db, sql, None) {
            Ok(compiled) => Ok(PreparedStatement::new(self, compiled, None)),
            Err(err) => self.finish(inner, Err(err)),
        }
    }

    /// [`query`](Self::query) through [`prepare_direct`](Self::prepare_direct).
    pub fn query_direct(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut prepared = self.prepare_direct(sql)?;
        prepared.bind_all(params)?;
        prepared.all_rows()
    }

    /// Run `sql` once per connection; later calls with the same text are
    /// no-ops. Shares its bookkeeping with rewrite prerequisites.
    pub fn ensure_prerequisite(&self, sql: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_active()?;
        if inner.prerequisites.contains(sql) {
            return Ok(());
        }
        if let Err(err) = exec(inner.db, sql) {
            return self.finish(inner, Err(err));
        }
        inner.prerequisites.insert(sql.to_string());
        Ok(())
    }

    /// Hand a statement back to the cache, or finalize it when it is stale.
    pub(crate) fn recycle_statement(&self, statement: HandleStatement, generation: u64) {
        let mut inner = self.lock();
        let reusable = inner.state == HandleState::Active
            && generation == inner.cache_generation
            && inner.cache.len() < MAX_CACHED_STATEMENTS
            && !inner.cache.contains_key(statement.sql());
        if reusable {
            statement.reset();
            statement.clear_bindings();
            inner.cache.insert(statement.sql().to_string(), statement);
        }
    }

    /// Number of statements currently cached.
    pub fn cached_statement_count(&self) -> usize {
        self.lock().cache.len()
    }

    /// Finalize every cached statement.
    pub fn finalize_all_statements(&self) {
        self.lock().cache.clear();
    }

    /// Prepare, step to completion and reset.
    pub fn execute<S: Statement + ?Sized>(&self, statement: &S) -> Result<()> {
        self.prepare(statement)?.run()
    }

    /// Execute with bound parameters; returns the number of changed rows.
    pub fn execute_with<S: Statement + ?Sized>(&self, statement: &S, params: &[Value]) -> Result<i64> {
        let mut prepared = self.prepare(statement)?;
        prepared.bind_all(params)?;
        prepared.run()?;
        drop(prepared);
        Ok(self.changes())
    }

    /// Run a query and collect every row.
    pub fn query<S: Statement + ?Sized>(&self, statement: &S, params: &[Value]) -> Result<Vec<Row>> {
        let mut prepared = self.prepare(statement)?;
        prepared.bind_all(params)?;
        prepared.all_rows()
    }

    pub fn query_one<S: Statement + ?Sized>(
        &self,
        statement: &S,
        params: &[Value],
    ) -> Result<Option<Row>> {
        let mut prepared = self.prepare(statement)?;
        prepared.bind_all(params)?;
        if prepared.step()? {
            Ok(Some(prepared.row()))
        } else {
            Ok(None)
        }
    }

    /// First column of the first row.
    pub fn query_value<S: Statement + ?Sized>(
        &self,
        statement: &S,
        params: &[Value],
    ) -> Result<Option<Value>> {
        let mut prepared = self.prepare(statement)?;
        prepared.bind_all(params)?;
        if prepared.step()? {
            Ok(Some(prepared.column_value(0)))
        } else {
            Ok(None)
        }
    }

    pub fn last_inserted_row_id(&self) -> i64 {
        let inner = self.lock();
        if inner.state != HandleState::Active {
            return 0;
        }
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Rows changed by the last statement. For a rewritten write this is the
    /// sum over every table it touched.
    pub fn changes(&self) -> i64 {
        let inner = self.lock();
        if inner.state != HandleState::Active {
            return 0;
        }
        if let Some(changes) = inner.composite_changes {
            return changes;
        }
        // SAFETY: db is valid
        i64::from(unsafe { ffi::sqlite3_changes(inner.db) })
    }

    pub fn total_changes(&self) -> i64 {
        let inner = self.lock();
        if inner.state != HandleState::Active {
            return 0;
        }
        // SAFETY: db is valid
        i64::from(unsafe { ffi::sqlite3_total_changes(inner.db) })
    }

    /// Observe `signal`; a raised signal interrupts the running statement
    /// within one progress interval.
    pub fn attach_cancellation_signal(&self, signal: &CancellationSignal) {
        self.hooks.attach_cancellation(signal.observer());
    }

    pub fn detach_cancellation_signal(&self) {
        self.hooks.detach_cancellation();
    }

    /// Finalize all statements and close the native connection. One-way.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        if inner.state == HandleState::Invalidated {
            return;
        }
        inner.cache.clear();
        if !inner.db.is_null() {
            // SAFETY: db is valid and every cached statement was finalized
            let rc = unsafe { ffi::sqlite3_close(inner.db) };
            if rc != ffi::SQLITE_OK {
                tracing::warn!(
                    path = %self.config.path,
                    handle = self.id,
                    rc,
                    "connection closed with statements outstanding"
                );
            }
            inner.db = ptr::null_mut();
        }
        inner.state = HandleState::Invalidated;
        tracing::debug!(path = %self.config.path, handle = self.id, "invalidated handle");
    }

    pub fn is_in_transaction(&self) -> bool {
        let inner = self.lock();
        // SAFETY: db is valid while active
        inner.state == HandleState::Active && unsafe { ffi::sqlite3_get_autocommit(inner.db) } == 0
    }

    /// `BEGIN IMMEDIATE`.
    pub fn begin_transaction(&self) -> Result<()> {
        if self.is_in_transaction() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyInTransaction,
                message: "Already in a transaction".to_string(),
            }));
        }
        self.execute_raw("BEGIN IMMEDIATE")
    }

    pub fn commit_transaction(&self) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(not_in_transaction());
        }
        self.execute_raw("COMMIT")
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(not_in_transaction());
        }
        self.execute_raw("ROLLBACK")
    }

    /// Run `f` in a transaction. Commits when it returns `Ok(true)`, rolls
    /// back on `Ok(false)` or an error.
    pub fn run_transaction<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&Handle) -> Result<bool>,
    {
        self.begin_transaction()?;
        match f(self) {
            Ok(true) => match self.commit_transaction() {
                Ok(()) => Ok(true),
                Err(err) => {
                    let _ = self.rollback_transaction();
                    Err(err)
                }
            },
            Ok(false) => {
                self.rollback_transaction()?;
                Ok(false)
            }
            Err(err) => {
                if self.is_in_transaction() {
                    let _ = self.rollback_transaction();
                }
                Err(err)
            }
        }
    }

    /// Like [`run_transaction`](Self::run_transaction), but nests as a
    /// savepoint when a transaction is already open.
    pub fn run_embedded_transaction<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&Handle) -> Result<bool>,
    {
        if !self.is_in_transaction() {
            return self.run_transaction(f);
        }
        let name = self.savepoint()?;
        match f(self) {
            Ok(true) => {
                self.release_savepoint(&name)?;
                Ok(true)
            }
            Ok(false) => {
                self.rollback_to_savepoint(&name)?;
                self.release_savepoint(&name)?;
                Ok(false)
            }
            Err(err) => {
                let _ = self.rollback_to_savepoint(&name);
                let _ = self.release_savepoint(&name);
                Err(err)
            }
        }
    }

    /// Open a savepoint with a generated name and return the name.
    pub fn savepoint(&self) -> Result<String> {
        let name = {
            let mut inner = self.lock();
            inner.savepoint_seq += 1;
            format!("tidesql_sp_{}", inner.savepoint_seq)
        };
        self.execute_raw(&format!("SAVEPOINT {}", quote_ident(&name)))?;
        Ok(name)
    }

    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("RELEASE {}", quote_ident(name)))
            .map_err(|err| savepoint_error(err, name))
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("ROLLBACK TO {}", quote_ident(name)))
            .map_err(|err| savepoint_error(err, name))
    }

    /// Run a WAL checkpoint on every attached database.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        self.with_db(|db, _| {
            let mut log_frames: c_int = 0;
            let mut checkpointed: c_int = 0;
            // SAFETY: db is valid, out-pointers are valid
            let rc = unsafe {
                ffi::sqlite3_wal_checkpoint_v2(
                    db,
                    ptr::null(),
                    mode.code(),
                    &mut log_frames,
                    &mut checkpointed,
                )
            };
            if rc != ffi::SQLITE_OK {
                return Err(engine_error(db, rc, None));
            }
            Ok(CheckpointResult {
                log_frames,
                checkpointed_frames: checkpointed,
            })
        })
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.table_exists_in("main", table)
    }

    pub fn table_exists_in(&self, schema: &str, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
            quote_ident(schema)
        );
        let found = self.with_db(|db, _| {
            let stmt = prepare_raw(db, &sql)?;
            let guard = StmtGuard(stmt);
            // SAFETY: stmt is valid; SQLite copies the text
            let rc = unsafe { crate::types::bind_text(guard.0, 1, table) };
            if rc != ffi::SQLITE_OK {
                return Err(engine_error(db, rc, Some(&sql)));
            }
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(guard.0) } {
                ffi::SQLITE_ROW => Ok(true),
                ffi::SQLITE_DONE => Ok(false),
                rc => Err(engine_error(db, rc, Some(&sql))),
            }
        })?;
        Ok(found)
    }

    /// Column names of a table in declaration order.
    pub fn table_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM pragma_table_info({}, {})",
            quote_literal(table),
            quote_literal(schema)
        );
        self.with_db(|db, _| {
            let guard = StmtGuard(prepare_raw(db, &sql)?);
            let mut names = Vec::new();
            loop {
                // SAFETY: stmt is valid
                match unsafe { ffi::sqlite3_step(guard.0) } {
                    ffi::SQLITE_ROW => {
                        // SAFETY: positioned on a row
                        if let Some(name) = unsafe { crate::types::read_text(guard.0, 0) } {
                            names.push(name);
                        }
                    }
                    ffi::SQLITE_DONE => break,
                    rc => return Err(engine_error(db, rc, Some(&sql))),
                }
            }
            Ok(names)
        })
    }

    /// Read every table once so its pages land in the page cache.
    pub fn preload_all_pages(&self) -> Result<()> {
        let page_count = self
            .query_value("PRAGMA page_count", &[])?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let cache_size = self
            .query_value("PRAGMA cache_size", &[])?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        // Negative cache sizes are in KiB rather than pages.
        if cache_size >= 0 && page_count > cache_size {
            self.execute_raw(&format!("PRAGMA cache_size = {}", page_count))?;
        }
        let tables = self.query(
            "SELECT name FROM main.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            &[],
        )?;
        for row in tables {
            if let Some(Value::Text(name)) = row.get(0) {
                self.execute_raw(&format!("SELECT * FROM main.{}", quote_ident(name)))?;
            }
        }
        Ok(())
    }

    pub fn vacuum(&self) -> Result<()> {
        self.execute_raw("VACUUM")
    }

    /// Write a compacted copy of the main database to `path`.
    pub fn vacuum_into(&self, path: &str) -> Result<()> {
        self.execute_raw(&format!("VACUUM main INTO {}", quote_literal(path)))
    }

    fn apply_trace_mask(&self, mask: c_uint) -> Result<()> {
        let ctx = self.hook_context();
        self.with_db(|db, _| {
            let callback = if mask == 0 {
                None
            } else {
                Some(hooks::trace_callback as unsafe extern "C" fn(_, _, _, _) -> _)
            };
            // SAFETY: db is valid; ctx outlives the connection
            let rc = unsafe { ffi::sqlite3_trace_v2(db, mask, callback, ctx) };
            if rc == ffi::SQLITE_OK {
                Ok(())
            } else {
                Err(engine_error(db, rc, None))
            }
        })
    }

    /// Add (`Some`) or remove (`None`) a named statement trace listener.
    pub fn set_trace_hook(&self, name: &str, hook: Option<SqlTraceHook>) -> Result<()> {
        let mask = self.hooks.set_sql_trace(name, hook);
        self.apply_trace_mask(mask)
    }

    /// Add (`Some`) or remove (`None`) a named statement timing listener.
    pub fn set_profile_hook(&self, name: &str, hook: Option<PerformanceHook>) -> Result<()> {
        let mask = self.hooks.set_performance_trace(name, hook);
        self.apply_trace_mask(mask)
    }

    /// Add (`Some`) or remove (`None`) a named WAL commit listener.
    pub fn set_wal_commit_hook(&self, name: &str, hook: Option<WalCommitHook>) -> Result<()> {
        let installed = self.hooks.set_wal_commit(name, hook);
        let ctx = self.hook_context();
        self.with_db(|db, _| {
            // SAFETY: db is valid; ctx outlives the connection
            unsafe {
                if installed {
                    ffi::sqlite3_wal_hook(db, Some(hooks::wal_callback), ctx);
                } else {
                    ffi::sqlite3_wal_hook(db, None, ptr::null_mut());
                }
            }
            Ok(())
        })
    }

    /// Observe every error this handle records. The observer runs without the
    /// handle's lock held.
    pub fn set_error_observer(&self, observer: Option<ErrorObserver>) {
        self.hooks.set_error_observer(observer);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("path", &self.config.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct StmtGuard(*mut ffi::sqlite3_stmt);

impl Drop for StmtGuard {
    fn drop(&mut self) {
        // SAFETY: the statement was produced by prepare_raw
        unsafe { ffi::sqlite3_finalize(self.0) };
    }
}

fn not_in_transaction() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotInTransaction,
        message: "Not in a transaction".to_string(),
    })
}

fn savepoint_error(err: Error, name: &str) -> Error {
    match &err {
        Error::Sql(e) if e.message.contains("no such savepoint") => {
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::SavepointNotFound,
                message: format!("no such savepoint: {}", name),
            })
        }
        _ => err,
    }
}

// Helper functions

pub(crate) fn exec(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| nul_in_sql(sql))?;
    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

    if !errmsg.is_null() {
        // SAFETY: errmsg was allocated by sqlite3_exec
        unsafe { ffi::sqlite3_free(errmsg.cast()) };
    }
    if rc != ffi::SQLITE_OK {
        return Err(engine_error(db, rc, Some(sql)));
    }
    Ok(())
}

pub(crate) fn prepare_raw(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| nul_in_sql(sql))?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };

    if rc != ffi::SQLITE_OK {
        return Err(engine_error(db, rc, Some(sql)));
    }
    if stmt.is_null() {
        return Err(Error::Sql(SqlError {
            kind: SqlErrorKind::Misuse,
            code: ffi::SQLITE_MISUSE,
            extended_code: ffi::SQLITE_MISUSE,
            message: "statement is empty".to_string(),
            sql: Some(sql.to_string()),
        }));
    }
    Ok(stmt)
}

fn nul_in_sql(sql: &str) -> Error {
    Error::Sql(SqlError {
        kind: SqlErrorKind::Misuse,
        code: ffi::SQLITE_MISUSE,
        extended_code: ffi::SQLITE_MISUSE,
        message: "SQL contains null byte".to_string(),
        sql: Some(sql.to_string()),
    })
}

/// Map an engine result code to an [`Error`].
pub(crate) fn engine_error(db: *mut ffi::sqlite3, rc: c_int, sql: Option<&str>) -> Error {
    let code = rc & 0xff;
    let (message, extended_code) = if db.is_null() {
        (ffi::error_string(rc).to_string(), rc)
    } else {
        // SAFETY: db is valid
        unsafe { (ffi::errmsg(db), ffi::sqlite3_extended_errcode(db)) }
    };
    let sql = sql.map(str::to_string);
    match code {
        ffi::SQLITE_INTERRUPT => Error::Cancelled,
        ffi::SQLITE_BUSY => Error::Busy(BusyError {
            kind: BusyKind::Busy,
            message,
            sql,
        }),
        ffi::SQLITE_LOCKED => Error::Busy(BusyError {
            kind: BusyKind::Locked,
            message,
            sql,
        }),
        _ => Error::Sql(SqlError {
            kind: error_code_to_kind(code),
            code,
            extended_code,
            message,
            sql,
        }),
    }
}

fn error_code_to_kind(code: c_int) -> SqlErrorKind {
    match code {
        ffi::SQLITE_ERROR => SqlErrorKind::Syntax,
        ffi::SQLITE_CONSTRAINT => SqlErrorKind::Constraint,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH => SqlErrorKind::Permission,
        ffi::SQLITE_READONLY => SqlErrorKind::ReadOnly,
        ffi::SQLITE_TOOBIG => SqlErrorKind::TooBig,
        ffi::SQLITE_CORRUPT | ffi::SQLITE_NOTADB => SqlErrorKind::Corrupt,
        ffi::SQLITE_FULL => SqlErrorKind::Full,
        ffi::SQLITE_SCHEMA => SqlErrorKind::Schema,
        ffi::SQLITE_MISUSE => SqlErrorKind::Misuse,
        _ => SqlErrorKind::Database,
    }
}

/// Human-readable name of a primary result code, for logs.
pub fn result_code_name(code: i32) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string
    unsafe {
        let ptr = ffi::sqlite3_errstr(code);
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::TraceContext;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};
    use tidesql_core::error::HandleErrorKind;

    fn people() -> Handle {
        let handle = Handle::open_memory().unwrap();
        handle
            .execute_raw("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();
        handle
    }

    #[test]
    fn test_open_memory() {
        let handle = Handle::open_memory().unwrap();
        assert_eq!(handle.path(), ":memory:");
        assert_eq!(handle.state(), HandleState::Active);
    }

    #[test]
    fn test_unopened_handle_is_misuse() {
        let handle = Handle::new(HandleConfig::memory());
        assert_eq!(handle.state(), HandleState::Uninitialized);
        let err = handle.execute_raw("SELECT 1").unwrap_err();
        assert!(matches!(err, Error::Handle(ref e) if e.kind == HandleErrorKind::Misuse));
    }

    #[test]
    fn test_execute_raw() {
        let handle = people();
        handle
            .execute_raw("INSERT INTO people (name) VALUES ('Alice')")
            .unwrap();
        assert_eq!(handle.changes(), 1);
        assert_eq!(handle.last_inserted_row_id(), 1);
        assert_eq!(handle.total_changes(), 1);
    }

    #[test]
    fn test_parameterized_query() {
        let handle = people();
        handle
            .execute_with(
                "INSERT INTO people (name, age) VALUES (?, ?)",
                &[Value::from("Alice"), Value::Integer(30)],
            )
            .unwrap();

        let rows = handle
            .query("SELECT * FROM people WHERE name = ?", &[Value::from("Alice")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "Alice");
        assert_eq!(rows[0].get_named::<i32>("age").unwrap(), 30);
    }

    #[test]
    fn test_null_handling() {
        let handle = people();
        handle
            .execute_with("INSERT INTO people (name) VALUES (?)", &[Value::Null])
            .unwrap();
        let rows = handle.query("SELECT * FROM people", &[]).unwrap();
        assert_eq!(rows[0].get_named::<Option<String>>("name").unwrap(), None);
    }

    #[test]
    fn test_statement_cache_reuse() {
        let handle = people();
        for i in 0..5 {
            handle
                .execute_with("INSERT INTO people (age) VALUES (?)", &[Value::Integer(i)])
                .unwrap();
        }
        assert_eq!(handle.cached_statement_count(), 1);

        // Two live checkouts of the same SQL compile separately.
        let a = handle.prepare("SELECT count(*) FROM people").unwrap();
        let b = handle.prepare("SELECT count(*) FROM people").unwrap();
        drop(a);
        drop(b);
        assert_eq!(handle.cached_statement_count(), 2);

        handle.finalize_all_statements();
        assert_eq!(handle.cached_statement_count(), 0);
    }

    #[test]
    fn test_cached_statement_rebinds_cleanly() {
        let handle = people();
        handle
            .execute_with("INSERT INTO people (name, age) VALUES (?, ?)", &[Value::from("a"), Value::Integer(1)])
            .unwrap();
        handle
            .execute_with("INSERT INTO people (name, age) VALUES (?, ?)", &[Value::from("b"), Value::Integer(2)])
            .unwrap();
        let total = handle
            .query_value("SELECT sum(age) FROM people", &[])
            .unwrap()
            .unwrap();
        assert_eq!(total, Value::Integer(3));
    }

    #[test]
    fn test_prepared_statement_protocol() {
        let handle = people();
        handle
            .execute_raw("INSERT INTO people (name, age) VALUES ('a', 1), ('b', 2)")
            .unwrap();

        let mut stmt = handle
            .prepare("SELECT name, age FROM people WHERE age >= ? ORDER BY id")
            .unwrap();
        assert!(stmt.is_readonly());
        assert_eq!(stmt.column_count(), 2);
        assert_eq!(stmt.column_name(1).as_deref(), Some("age"));

        stmt.bind_i64(1, 0).unwrap();
        assert!(stmt.step().unwrap());
        assert_eq!(stmt.column_text(0).as_deref(), Some("a"));
        assert_eq!(stmt.column_i64(1), 1);
        assert!(stmt.step().unwrap());
        assert!(!stmt.step().unwrap());
        assert!(stmt.done());

        stmt.reset();
        stmt.bind_i64(1, 2).unwrap();
        let rows = stmt.all_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "b");
    }

    #[test]
    fn test_bind_out_of_range() {
        let handle = people();
        let mut stmt = handle.prepare("SELECT * FROM people WHERE id = ?").unwrap();
        let err = stmt.bind_i64(2, 1).unwrap_err();
        assert!(matches!(err, Error::Handle(ref e) if e.kind == HandleErrorKind::OutOfRange));
        let err = stmt.bind_i64(0, 1).unwrap_err();
        assert!(matches!(err, Error::Handle(ref e) if e.kind == HandleErrorKind::OutOfRange));
    }

    #[test]
    fn test_error_slot() {
        let handle = people();
        assert!(handle.error().is_none());
        let err = handle.execute("SELECT * FROM missing").unwrap_err();
        assert!(matches!(err, Error::Sql(ref e) if e.kind == SqlErrorKind::Syntax));
        let info = handle.error().unwrap();
        assert_eq!(info.code, Some(ffi::SQLITE_ERROR));
        assert!(info.message.contains("missing"));
    }

    #[test]
    fn test_constraint_error() {
        let handle = people();
        handle.execute_raw("INSERT INTO people (id) VALUES (1)").unwrap();
        let err = handle
            .execute_raw("INSERT INTO people (id) VALUES (1)")
            .unwrap_err();
        assert!(err.is_constraint());
    }

    #[test]
    fn test_error_observer_sees_errors() {
        let handle = people();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        handle.set_error_observer(Some(Arc::new(move |ctx: TraceContext<'_>, _err: &Error| {
            assert_eq!(ctx.path, ":memory:");
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let _ = handle.execute("SELECT * FROM missing");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_is_one_way() {
        let handle = people();
        handle.prepare("SELECT * FROM people").unwrap().run().unwrap();
        handle.invalidate();
        handle.invalidate();
        assert!(handle.is_invalidated());
        assert_eq!(handle.cached_statement_count(), 0);
        let err = handle.execute("SELECT 1").unwrap_err();
        assert!(matches!(err, Error::Handle(ref e) if e.kind == HandleErrorKind::Invalidated));
        assert!(handle.open().is_err());
    }

    #[test]
    fn test_statement_outliving_invalidate_is_finalized() {
        let handle = people();
        let stmt = handle.prepare("SELECT * FROM people").unwrap();
        handle.invalidate();
        drop(stmt);
        assert_eq!(handle.cached_statement_count(), 0);
    }

    #[test]
    fn test_transaction() {
        let handle = people();
        handle.begin_transaction().unwrap();
        assert!(handle.is_in_transaction());
        handle.execute_raw("INSERT INTO people (name) VALUES ('x')").unwrap();
        handle.rollback_transaction().unwrap();
        assert!(!handle.is_in_transaction());
        let count = handle.query_value("SELECT count(*) FROM people", &[]).unwrap();
        assert_eq!(count, Some(Value::Integer(0)));

        assert!(matches!(
            handle.commit_transaction().unwrap_err(),
            Error::Transaction(ref e) if e.kind == TransactionErrorKind::NotInTransaction
        ));
    }

    #[test]
    fn test_run_transaction_outcomes() {
        let handle = people();
        let committed = handle
            .run_transaction(|h| {
                h.execute_raw("INSERT INTO people (name) VALUES ('kept')")?;
                Ok(true)
            })
            .unwrap();
        assert!(committed);

        let committed = handle
            .run_transaction(|h| {
                h.execute_raw("INSERT INTO people (name) VALUES ('dropped')")?;
                Ok(false)
            })
            .unwrap();
        assert!(!committed);

        let err = handle.run_transaction(|h| {
            h.execute_raw("INSERT INTO people (name) VALUES ('failed')")?;
            h.execute_raw("INSERT INTO nowhere VALUES (1)")?;
            Ok(true)
        });
        assert!(err.is_err());
        assert!(!handle.is_in_transaction());

        let names = handle.query("SELECT name FROM people", &[]).unwrap();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_embedded_transaction_uses_savepoint() {
        let handle = people();
        handle.begin_transaction().unwrap();
        handle.execute_raw("INSERT INTO people (name) VALUES ('outer')").unwrap();
        let kept = handle
            .run_embedded_transaction(|h| {
                h.execute_raw("INSERT INTO people (name) VALUES ('inner')")?;
                Ok(false)
            })
            .unwrap();
        assert!(!kept);
        assert!(handle.is_in_transaction());
        handle.commit_transaction().unwrap();

        let rows = handle.query("SELECT name FROM people", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "outer");
    }

    #[test]
    fn test_unknown_savepoint() {
        let handle = people();
        let err = handle.release_savepoint("nope").unwrap_err();
        assert!(matches!(err, Error::Transaction(ref e) if e.kind == TransactionErrorKind::SavepointNotFound));
    }

    #[test]
    fn test_table_introspection() {
        let handle = people();
        assert!(handle.table_exists("people").unwrap());
        assert!(!handle.table_exists("ghosts").unwrap());
        assert_eq!(
            handle.table_columns("main", "people").unwrap(),
            vec!["id", "name", "age"]
        );
    }

    #[test]
    fn test_cancellation_interrupts_long_query() {
        let handle = Arc::new(Handle::open_memory().unwrap());
        let signal = CancellationSignal::new();
        handle.attach_cancellation_signal(&signal);

        let worker = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let start = Instant::now();
                let result = handle.execute(
                    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c",
                );
                (result, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        signal.cancel();
        let (result, elapsed) = worker.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(elapsed < Duration::from_secs(10));

        handle.detach_cancellation_signal();
        handle.execute("SELECT 1").unwrap();
    }

    #[test]
    fn test_trace_and_profile_hooks() {
        let handle = people();
        let traced = Arc::new(Mutex::new(Vec::new()));
        let profiled = Arc::new(AtomicUsize::new(0));
        {
            let traced = Arc::clone(&traced);
            handle
                .set_trace_hook(
                    "test",
                    Some(Arc::new(move |_: TraceContext<'_>, sql: &str| {
                        traced.lock().unwrap().push(sql.to_string());
                    })),
                )
                .unwrap();
        }
        {
            let profiled = Arc::clone(&profiled);
            handle
                .set_profile_hook(
                    "test",
                    Some(Arc::new(move |_: TraceContext<'_>, _: &str, _: Duration| {
                        profiled.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }
        handle.execute("SELECT count(*) FROM people").unwrap();
        assert!(traced
            .lock()
            .unwrap()
            .iter()
            .any(|sql| sql.contains("count(*)")));
        assert!(profiled.load(Ordering::SeqCst) >= 1);

        handle.set_trace_hook("test", None).unwrap();
        let before = traced.lock().unwrap().len();
        handle.execute("SELECT 1").unwrap();
        assert_eq!(traced.lock().unwrap().len(), before);
    }

    #[test]
    fn test_checkpoint_and_wal_hook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");
        let handle = Handle::open_with(HandleConfig::file(path.to_string_lossy())).unwrap();
        handle.execute_raw("PRAGMA journal_mode = WAL").unwrap();

        let frames = Arc::new(AtomicUsize::new(0));
        {
            let frames = Arc::clone(&frames);
            handle
                .set_wal_commit_hook(
                    "test",
                    Some(Arc::new(move |_: TraceContext<'_>, n: u32| {
                        frames.store(n as usize, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }
        handle.execute_raw("CREATE TABLE t (x)").unwrap();
        handle.execute_raw("INSERT INTO t VALUES (1)").unwrap();
        assert!(frames.load(Ordering::SeqCst) > 0);

        let result = handle.checkpoint(CheckpointMode::Truncate).unwrap();
        assert_eq!(result.log_frames, 0);
    }

    #[test]
    fn test_vacuum_into_and_preload() {
        let dir = tempfile::tempdir().unwrap();
        let handle = people();
        handle
            .execute_raw("INSERT INTO people (name) VALUES ('a'), ('b')")
            .unwrap();
        handle.preload_all_pages().unwrap();

        let copy = dir.path().join("copy.db");
        handle.vacuum_into(&copy.to_string_lossy()).unwrap();
        let other = Handle::open_with(HandleConfig::file(copy.to_string_lossy())).unwrap();
        let count = other.query_value("SELECT count(*) FROM people", &[]).unwrap();
        assert_eq!(count, Some(Value::Integer(2)));
    }

    #[test]
    fn test_open_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        let err = Handle::open_with(
            HandleConfig::file(path.to_string_lossy()).flags(OpenFlags::read_write()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Connection(ref e) if e.kind == ConnectionErrorKind::Open));

        Handle::open_with(HandleConfig::file(path.to_string_lossy()))
            .unwrap()
            .execute_raw("CREATE TABLE t (x)")
            .unwrap();
        let ro = Handle::open_with(
            HandleConfig::file(path.to_string_lossy()).flags(OpenFlags::read_only()),
        )
        .unwrap();
        let err = ro.execute_raw("INSERT INTO t VALUES (1)").unwrap_err();
        assert!(matches!(err, Error::Sql(ref e) if e.kind == SqlErrorKind::ReadOnly));
    }

    #[test]
    fn test_result_code_name() {
        assert_eq!(result_code_name(ffi::SQLITE_BUSY), "database is locked");
    }
}
