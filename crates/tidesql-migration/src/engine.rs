//! Registration and batch advance of migrations.

use crate::info::{MigrationBaseInfo, MigrationInfo, MigrationProgress, MigrationState};
use crate::mapping::{MappingSet, MappingSnapshot};
use crate::rewrite;
use regex::{NoExpand, Regex};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use tidesql_core::error::{Error, MigrationError, MigrationErrorKind};
use tidesql_core::{Result, RetryPolicy, StatementInfo, Value, quote_qualified, retry_busy};
use tidesql_sqlite::{Handle, Rewrite, StatementRewriter};

/// `CREATE TABLE [IF NOT EXISTS] [schema.]name` at the start of a table's SQL.
static CREATE_TABLE_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:(?:"(?:[^"]|"")*"|\[[^\]]*\]|`[^`]*`|[\w$]+)\s*\.\s*)?(?:"(?:[^"]|"")*"|\[[^\]]*\]|`[^`]*`|[\w$]+)"#,
    )
    .unwrap_or_else(|e| panic!("invalid CREATE TABLE pattern: {e}"))
});

static WITHOUT_ROWID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWITHOUT\s+ROWID\b")
        .unwrap_or_else(|e| panic!("invalid WITHOUT ROWID pattern: {e}"))
});

/// Tuning for batch advance.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Source rows moved per batch
    pub batch_size: usize,
    /// Drop an unfiltered source table once it is empty
    pub drop_source_when_done: bool,
    /// Backoff for busy batches
    pub retry: RetryPolicy,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            drop_source_when_done: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl MigrationSettings {
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows.max(1);
        self
    }

    pub fn drop_source_when_done(mut self, drop: bool) -> Self {
        self.drop_source_when_done = drop;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub table: String,
    pub rows: u64,
    /// No eligible rows remain; the table left the mapping set.
    pub done: bool,
}

struct Tracked {
    info: Arc<MigrationInfo>,
    state: MigrationState,
    rows_migrated: u64,
    batches: u64,
}

/// Every migration of one database.
///
/// The engine is also the database's [`StatementRewriter`]: install it on a
/// handle (see [`MigrationConfig`](crate::MigrationConfig)) and statements
/// against migrating tables are rewritten from the current snapshot.
pub struct MigrationEngine {
    mappings: MappingSet,
    settings: MigrationSettings,
    tracked: Mutex<Vec<Tracked>>,
    cursor: AtomicUsize,
}

impl MigrationEngine {
    pub fn new(settings: MigrationSettings) -> Self {
        Self {
            mappings: MappingSet::new(),
            settings,
            tracked: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> Arc<MappingSnapshot> {
        self.mappings.load()
    }

    fn tracked(&self) -> MutexGuard<'_, Vec<Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `base` on `handle`, create the target when missing and start
    /// rewriting statements against it.
    #[tracing::instrument(level = "debug", skip_all, fields(table = %base.table))]
    pub fn register(&self, handle: &Handle, base: MigrationBaseInfo) -> Result<Arc<MigrationInfo>> {
        base.validate()?;
        let schema = base.schema_name();
        let draft = MigrationInfo::new(base.clone(), Vec::new(), false);
        if let Some(attach) = draft.attach_sql() {
            handle.ensure_prerequisite(&attach)?;
        }

        let source_sql = table_sql(handle, &schema, &base.source_table)?.ok_or_else(|| {
            migration_error(
                MigrationErrorKind::InvalidSource,
                &base.table,
                format!("source table '{}' does not exist", base.source_table),
            )
        })?;
        if is_without_rowid(&source_sql) {
            return Err(migration_error(
                MigrationErrorKind::InvalidSource,
                &base.table,
                "WITHOUT ROWID source tables cannot be migrated".to_string(),
            ));
        }

        if !handle.table_exists(&base.table)? {
            let create = CREATE_TABLE_HEAD.replace(
                &source_sql,
                NoExpand(&format!("CREATE TABLE {}", quote_qualified("main", &base.table))),
            );
            handle.execute_raw(&create)?;
            tracing::info!(table = %base.table, source = %base.source_table, "created migration target");
        }

        let source = table_shape(handle, &schema, &base.source_table)?;
        let target = table_shape(handle, "main", &base.table)?;
        let mut source_names: Vec<String> = source.columns.iter().map(|c| c.to_ascii_lowercase()).collect();
        let mut target_names: Vec<String> = target.columns.iter().map(|c| c.to_ascii_lowercase()).collect();
        source_names.sort();
        target_names.sort();
        if source_names != target_names {
            return Err(migration_error(
                MigrationErrorKind::Incompatible,
                &base.table,
                format!(
                    "columns differ: source has [{}], target has [{}]",
                    source.columns.join(", "),
                    target.columns.join(", ")
                ),
            ));
        }
        let integer_primary_key = match (&source.integer_primary_key, &target.integer_primary_key) {
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => true,
            (None, None) => false,
            _ => {
                return Err(migration_error(
                    MigrationErrorKind::Incompatible,
                    &base.table,
                    "source and target disagree on the INTEGER PRIMARY KEY column".to_string(),
                ));
            }
        };

        let info = Arc::new(MigrationInfo::new(base, source.columns, integer_primary_key));
        if info.base().filter.is_some() {
            // Surfaces a malformed filter now rather than on first use.
            handle.execute_raw(&format!(
                "SELECT 1 FROM {} WHERE {} LIMIT 0",
                info.qualified_source(),
                info.predicate()
            ))?;
        }

        self.mappings.insert(Arc::clone(&info))?;
        let mut tracked = self.tracked();
        tracked.retain(|t| !t.info.table().eq_ignore_ascii_case(info.table()));
        tracked.push(Tracked {
            info: Arc::clone(&info),
            state: MigrationState::Migrating,
            rows_migrated: 0,
            batches: 0,
        });
        tracing::info!(table = %info.table(), source = %info.qualified_source(), "registered migration");
        Ok(info)
    }

    /// Is `table` registered and not yet done?
    pub fn is_migrating(&self, table: &str) -> bool {
        self.snapshot().get(table).is_some()
    }

    /// True when every registered migration is done (or none is registered).
    pub fn is_done(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Progress of every migration ever registered, in registration order.
    pub fn progress(&self) -> Vec<MigrationProgress> {
        self.tracked().iter().map(progress_of).collect()
    }

    pub fn progress_of(&self, table: &str) -> Option<MigrationProgress> {
        self.tracked()
            .iter()
            .find(|t| t.info.table().eq_ignore_ascii_case(table))
            .map(progress_of)
    }

    /// Let a paused migration advance again.
    pub fn resume(&self, table: &str) -> bool {
        let mut tracked = self.tracked();
        match tracked.iter_mut().find(|t| t.info.table().eq_ignore_ascii_case(table)) {
            Some(t) if matches!(t.state, MigrationState::Paused { .. }) => {
                t.state = MigrationState::Migrating;
                tracing::info!(table, "resumed migration");
                true
            }
            _ => false,
        }
    }

    /// Any migration that would advance on the next [`step`](Self::step)?
    pub fn has_runnable(&self) -> bool {
        self.tracked()
            .iter()
            .any(|t| t.state == MigrationState::Migrating)
    }

    /// Advance the next runnable migration (round-robin) by one batch.
    /// `Ok(None)` when nothing is runnable.
    pub fn step(&self, handle: &Handle) -> Result<Option<StepReport>> {
        let next = {
            let tracked = self.tracked();
            let runnable: Vec<Arc<MigrationInfo>> = tracked
                .iter()
                .filter(|t| t.state == MigrationState::Migrating)
                .map(|t| Arc::clone(&t.info))
                .collect();
            if runnable.is_empty() {
                None
            } else {
                let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&runnable[turn % runnable.len()]))
            }
        };
        match next {
            Some(info) => self.advance(handle, &info).map(Some),
            None => Ok(None),
        }
    }

    /// Advance the migration into `table` by one batch.
    pub fn step_table(&self, handle: &Handle, table: &str) -> Result<StepReport> {
        let info = {
            let tracked = self.tracked();
            let entry = tracked
                .iter()
                .find(|t| t.info.table().eq_ignore_ascii_case(table))
                .ok_or_else(|| {
                    migration_error(
                        MigrationErrorKind::InvalidSource,
                        table,
                        "no migration registered for this table".to_string(),
                    )
                })?;
            match &entry.state {
                MigrationState::Done => {
                    return Ok(StepReport {
                        table: entry.info.table().to_string(),
                        rows: 0,
                        done: true,
                    });
                }
                MigrationState::Paused { reason } => {
                    return Err(migration_error(MigrationErrorKind::Paused, table, reason.clone()));
                }
                MigrationState::Migrating => Arc::clone(&entry.info),
            }
        };
        self.advance(handle, &info)
    }

    /// One batch: move the first `batch_size` eligible rows (by rowid) in a
    /// single write transaction.
    #[tracing::instrument(level = "debug", skip_all, fields(table = %info.table()))]
    fn advance(&self, handle: &Handle, info: &Arc<MigrationInfo>) -> Result<StepReport> {
        let outcome = retry_busy(&self.settings.retry, || self.run_batch(handle, info));
        let (rows, remaining) = match outcome {
            Ok(batch) => batch,
            Err(err) if err.is_retryable() || matches!(err, Error::Cancelled) => {
                tracing::debug!(table = %info.table(), error = %err, "batch deferred");
                return Err(err);
            }
            Err(err) => {
                let reason = err.to_string();
                self.set_state(info, MigrationState::Paused {
                    reason: reason.clone(),
                });
                tracing::warn!(table = %info.table(), error = %err, "migration paused");
                return Err(Error::Migration(MigrationError {
                    kind: MigrationErrorKind::Paused,
                    table: info.table().to_string(),
                    message: reason,
                    source: Some(Box::new(err)),
                }));
            }
        };

        {
            let mut tracked = self.tracked();
            if let Some(t) = tracked.iter_mut().find(|t| Arc::ptr_eq(&t.info, info)) {
                t.rows_migrated += rows;
                t.batches += 1;
            }
        }
        tracing::debug!(table = %info.table(), rows, remaining, "migrated batch");

        if !remaining {
            self.complete(handle, info);
        }
        Ok(StepReport {
            table: info.table().to_string(),
            rows,
            done: !remaining,
        })
    }

    /// Returns rows moved and whether eligible rows remain.
    fn run_batch(&self, handle: &Handle, info: &MigrationInfo) -> Result<(u64, bool)> {
        if let Some(attach) = info.attach_sql() {
            handle.ensure_prerequisite(&attach)?;
        }
        let source = info.qualified_source();
        let target = info.qualified_table();
        let predicate = info.predicate();
        let copy = info.copy_columns();

        handle.begin_transaction()?;
        let result = (|| {
            let bound = handle
                .query_direct(
                    &format!(
                        "SELECT max(rowid) FROM (SELECT rowid FROM {source} WHERE {predicate} ORDER BY rowid LIMIT ?1)"
                    ),
                    &[Value::from(i64::try_from(self.settings.batch_size).unwrap_or(i64::MAX))],
                )?
                .first()
                .and_then(|row| row.get(0))
                .and_then(Value::as_i64);
            let Some(bound) = bound else {
                return Ok((0, false));
            };

            run_direct(
                handle,
                &format!(
                    "INSERT OR REPLACE INTO {target}({copy}) SELECT {copy} FROM {source} WHERE {predicate} AND rowid <= ?1"
                ),
                bound,
            )?;
            let moved = run_direct(
                handle,
                &format!("DELETE FROM {source} WHERE {predicate} AND rowid <= ?1"),
                bound,
            )?;
            let remaining = handle
                .query_direct(
                    &format!("SELECT EXISTS (SELECT 1 FROM {source} WHERE {predicate})"),
                    &[],
                )?
                .first()
                .and_then(|row| row.get(0))
                .and_then(Value::as_i64)
                .is_some_and(|v| v != 0);
            Ok((u64::try_from(moved).unwrap_or(0), remaining))
        })();

        match result {
            Ok(batch) => match handle.commit_transaction() {
                Ok(()) => Ok(batch),
                Err(err) => {
                    let _ = handle.rollback_transaction();
                    Err(err)
                }
            },
            Err(err) => {
                if handle.is_in_transaction() {
                    let _ = handle.rollback_transaction();
                }
                Err(err)
            }
        }
    }

    /// Remove a finished migration from the mapping set. A same-file source
    /// name keeps resolving to the target from now on.
    fn complete(&self, handle: &Handle, info: &Arc<MigrationInfo>) {
        self.mappings.remove(info.table());
        self.set_state(info, MigrationState::Done);
        tracing::info!(table = %info.table(), "migration done");

        if self.settings.drop_source_when_done && info.base().filter.is_none() {
            let drop = format!("DROP TABLE IF EXISTS {}", info.qualified_source());
            if let Err(err) = handle.execute_raw(&drop) {
                tracing::warn!(table = %info.table(), error = %err, "failed to drop migrated source");
            }
        }
    }

    fn set_state(&self, info: &Arc<MigrationInfo>, state: MigrationState) {
        let mut tracked = self.tracked();
        if let Some(t) = tracked.iter_mut().find(|t| Arc::ptr_eq(&t.info, info)) {
            t.state = state;
        }
    }
}

impl StatementRewriter for MigrationEngine {
    fn generation(&self) -> u64 {
        self.mappings.generation()
    }

    fn is_active(&self) -> bool {
        !self.mappings.is_inert()
    }

    fn rewrite(&self, sql: &str, info: &StatementInfo) -> Result<Option<Rewrite>> {
        rewrite::rewrite(sql, info, &self.mappings.load())
    }
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("settings", &self.settings)
            .field("active", &self.mappings.load().len())
            .finish_non_exhaustive()
    }
}

fn progress_of(t: &Tracked) -> MigrationProgress {
    MigrationProgress {
        table: t.info.table().to_string(),
        source_table: t.info.source_table().to_string(),
        source_database: t.info.base().source_database.clone(),
        state: t.state.clone(),
        rows_migrated: t.rows_migrated,
        batches: t.batches,
    }
}

fn migration_error(kind: MigrationErrorKind, table: &str, message: String) -> Error {
    Error::Migration(MigrationError {
        kind,
        table: table.to_string(),
        message,
        source: None,
    })
}

/// Run a statement that binds one integer; returns the changed rows.
fn run_direct(handle: &Handle, sql: &str, bound: i64) -> Result<i64> {
    let mut statement = handle.prepare_direct(sql)?;
    statement.bind_i64(1, bound)?;
    statement.run()?;
    drop(statement);
    Ok(handle.changes())
}

fn table_sql(handle: &Handle, schema: &str, table: &str) -> Result<Option<String>> {
    let rows = handle.query_direct(
        &format!(
            "SELECT sql FROM {} WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            quote_qualified(schema, "sqlite_master")
        ),
        &[Value::from(table)],
    )?;
    Ok(rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(|v| v.as_str().map(str::to_string)))
}

fn is_without_rowid(create_sql: &str) -> bool {
    let options = create_sql.rfind(')').map_or("", |i| &create_sql[i..]);
    WITHOUT_ROWID.is_match(options)
}

struct TableShape {
    columns: Vec<String>,
    /// Name of the column aliasing the rowid, if any.
    integer_primary_key: Option<String>,
}

fn table_shape(handle: &Handle, schema: &str, table: &str) -> Result<TableShape> {
    let rows = handle.query_direct(
        "SELECT name, type, pk FROM pragma_table_info(?1, ?2) ORDER BY cid",
        &[Value::from(table), Value::from(schema)],
    )?;
    let mut columns = Vec::with_capacity(rows.len());
    let mut keys = Vec::new();
    for row in &rows {
        let name = row.get(0).and_then(Value::as_str).unwrap_or_default().to_string();
        let declared = row.get(1).and_then(Value::as_str).unwrap_or_default();
        let pk = row.get(2).and_then(Value::as_i64).unwrap_or(0);
        if pk > 0 {
            keys.push((name.clone(), declared.eq_ignore_ascii_case("INTEGER")));
        }
        columns.push(name);
    }
    let integer_primary_key = match keys.as_slice() {
        [(name, true)] => Some(name.clone()),
        _ => None,
    };
    Ok(TableShape {
        columns,
        integer_primary_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MigrationConfig;
    use tidesql_sqlite::{Config, HandleConfig};

    fn count(handle: &Handle, sql: &str) -> i64 {
        handle
            .query_direct(sql, &[])
            .unwrap()
            .first()
            .and_then(|r| r.get(0))
            .and_then(Value::as_i64)
            .unwrap()
    }

    fn seeded(rows: i64) -> (tempfile::TempDir, Handle) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db").to_string_lossy().into_owned();
        let handle = Handle::open_with(HandleConfig::file(path)).unwrap();
        handle
            .execute_raw("CREATE TABLE old_users (id INTEGER PRIMARY KEY, name TEXT, kind INTEGER)")
            .unwrap();
        handle
            .execute_raw(&format!(
                "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < {rows}) \
                 INSERT INTO old_users SELECT i, 'user' || i, i % 2 FROM n"
            ))
            .unwrap();
        (dir, handle)
    }

    fn engine(batch: usize) -> Arc<MigrationEngine> {
        Arc::new(MigrationEngine::new(MigrationSettings::default().batch_size(batch)))
    }

    #[test]
    fn register_creates_target_from_source_schema() {
        let (_dir, handle) = seeded(3);
        let engine = engine(10);
        let info = engine
            .register(&handle, MigrationBaseInfo::new("users", "old_users"))
            .unwrap();
        assert!(handle.table_exists("users").unwrap());
        assert!(info.has_integer_primary_key());
        assert_eq!(info.columns(), ["id", "name", "kind"]);
        assert!(engine.is_migrating("USERS"));
        assert!(engine.register(&handle, MigrationBaseInfo::new("users", "old_users")).is_err());
    }

    #[test]
    fn register_rejects_bad_sources() {
        let (_dir, handle) = seeded(1);
        let engine = engine(10);
        let missing = engine.register(&handle, MigrationBaseInfo::new("a", "nope")).unwrap_err();
        assert!(matches!(missing, Error::Migration(ref e) if e.kind == MigrationErrorKind::InvalidSource));

        handle
            .execute_raw("CREATE TABLE wr (k TEXT PRIMARY KEY, v) WITHOUT ROWID")
            .unwrap();
        assert!(engine.register(&handle, MigrationBaseInfo::new("b", "wr")).is_err());

        handle.execute_raw("CREATE TABLE narrow (id INTEGER PRIMARY KEY)").unwrap();
        let incompatible = engine
            .register(&handle, MigrationBaseInfo::new("narrow", "old_users"))
            .unwrap_err();
        assert!(matches!(incompatible, Error::Migration(ref e) if e.kind == MigrationErrorKind::Incompatible));

        assert!(
            engine
                .register(&handle, MigrationBaseInfo::new("c", "old_users").filter("no_such_col = 1"))
                .is_err()
        );
        assert!(engine.is_done());
    }

    #[test]
    fn batches_run_to_completion() {
        let (_dir, handle) = seeded(1000);
        let engine = engine(100);
        engine
            .register(&handle, MigrationBaseInfo::new("users", "old_users"))
            .unwrap();
        let generation = engine.generation();
        let mut steps = 0;
        loop {
            let report = engine.step(&handle).unwrap().unwrap();
            steps += 1;
            assert_eq!(report.rows, 100);
            if report.done {
                break;
            }
        }
        assert_eq!(steps, 10);
        assert!(engine.step(&handle).unwrap().is_none());
        assert!(engine.generation() > generation);
        assert!(engine.is_done());
        // The old name still resolves to the target.
        assert!(engine.is_active());
        assert_eq!(count(&handle, "SELECT count(*) FROM users"), 1000);
        assert_eq!(count(&handle, "SELECT count(*) FROM old_users"), 0);
        let progress = engine.progress_of("users").unwrap();
        assert_eq!(progress.state, MigrationState::Done);
        assert_eq!(progress.rows_migrated, 1000);
        assert_eq!(progress.batches, 10);
    }

    #[test]
    fn filtered_migration_leaves_other_rows() {
        let (_dir, handle) = seeded(20);
        let engine = Arc::new(MigrationEngine::new(
            MigrationSettings::default().batch_size(4).drop_source_when_done(true),
        ));
        engine
            .register(&handle, MigrationBaseInfo::new("odd", "old_users").filter("kind = 1"))
            .unwrap();
        while !engine.step_table(&handle, "odd").unwrap().done {}
        assert_eq!(count(&handle, "SELECT count(*) FROM odd"), 10);
        // Filtered sources are never dropped.
        assert_eq!(count(&handle, "SELECT count(*) FROM old_users"), 10);
    }

    #[test]
    fn unfiltered_source_can_be_dropped() {
        let (_dir, handle) = seeded(5);
        let engine = Arc::new(MigrationEngine::new(
            MigrationSettings::default().drop_source_when_done(true),
        ));
        engine
            .register(&handle, MigrationBaseInfo::new("users", "old_users"))
            .unwrap();
        assert!(engine.step(&handle).unwrap().unwrap().done);
        assert!(!handle.table_exists("old_users").unwrap());
    }

    #[test]
    fn failing_batch_pauses_until_resumed() {
        let (_dir, handle) = seeded(10);
        let engine = engine(5);
        engine
            .register(&handle, MigrationBaseInfo::new("users", "old_users"))
            .unwrap();
        handle
            .execute_raw(
                "CREATE TRIGGER no_copy BEFORE INSERT ON users BEGIN SELECT RAISE(ABORT, 'blocked'); END",
            )
            .unwrap();
        let err = engine.step(&handle).unwrap_err();
        assert!(matches!(err, Error::Migration(ref e) if e.kind == MigrationErrorKind::Paused));
        assert!(matches!(
            engine.progress_of("users").unwrap().state,
            MigrationState::Paused { .. }
        ));
        assert!(engine.step(&handle).unwrap().is_none());
        assert_eq!(count(&handle, "SELECT count(*) FROM old_users"), 10);

        handle.execute_raw("DROP TRIGGER no_copy").unwrap();
        assert!(engine.resume("users"));
        assert_eq!(engine.step(&handle).unwrap().unwrap().rows, 5);
    }

    #[test]
    fn round_robin_over_tables() {
        let (_dir, handle) = seeded(10);
        handle
            .execute_raw("CREATE TABLE old_tags (id INTEGER PRIMARY KEY, label TEXT)")
            .unwrap();
        handle
            .execute_raw("INSERT INTO old_tags(label) VALUES ('a'), ('b'), ('c')")
            .unwrap();
        let engine = engine(2);
        engine.register(&handle, MigrationBaseInfo::new("users", "old_users")).unwrap();
        engine.register(&handle, MigrationBaseInfo::new("tags", "old_tags")).unwrap();
        let first = engine.step(&handle).unwrap().unwrap();
        let second = engine.step(&handle).unwrap().unwrap();
        assert_ne!(first.table, second.table);
    }

    #[test]
    fn migration_from_another_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.db");
        let legacy = Handle::open_with(HandleConfig::file(old.to_string_lossy())).unwrap();
        legacy.execute_raw("CREATE TABLE notes (body TEXT)").unwrap();
        legacy
            .execute_raw("INSERT INTO notes VALUES ('a'), ('b'), ('c')")
            .unwrap();
        drop(legacy);

        let handle =
            Handle::open_with(HandleConfig::file(dir.path().join("new.db").to_string_lossy())).unwrap();
        let engine = engine(2);
        engine
            .register(&handle, MigrationBaseInfo::new("notes", "notes").from_database(&old))
            .unwrap();
        MigrationConfig::new(Arc::clone(&engine)).invoke(&handle).unwrap();

        assert_eq!(count(&handle, "SELECT count(*) FROM main.notes"), 0);
        let rows = handle.query("SELECT body FROM notes ORDER BY body", &[]).unwrap();
        assert_eq!(rows.len(), 3);

        engine.step(&handle).unwrap();
        handle.execute_with("INSERT INTO notes VALUES (?)", &[Value::from("d")]).unwrap();
        let rows = handle.query("SELECT body FROM notes ORDER BY body", &[]).unwrap();
        let bodies: Vec<_> = rows
            .iter()
            .map(|r| r.get(0).and_then(Value::as_str).unwrap().to_string())
            .collect();
        assert_eq!(bodies, ["a", "b", "c", "d"]);

        while !engine.step(&handle).unwrap().unwrap().done {}
        assert_eq!(count(&handle, "SELECT count(*) FROM main.notes"), 4);
    }
}
