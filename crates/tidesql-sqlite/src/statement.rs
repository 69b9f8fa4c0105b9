//! Compiled statements and the statement rewriting seam.
//!
//! A [`HandleStatement`] is one or more compiled `sqlite3_stmt`s standing in
//! for a single logical statement. Plain statements compile to one step. A
//! [`StatementRewriter`] installed on the handle may expand a statement into
//! several steps (set-up, the primary statement, mirrored writes, checks,
//! clean-up) which then run together inside one savepoint.
//!
//! [`PreparedStatement`] is the checked-out form: it borrows the handle,
//! owns the compiled statement while in use, and hands it back to the
//! handle's cache on drop.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::ffi;
use crate::handle::{Handle, engine_error, exec, prepare_raw};
use crate::types::{self, ColumnType};
use std::ffi::c_int;
use std::sync::Arc;
use tidesql_core::error::{Error, HandleError, HandleErrorKind, SqlError, SqlErrorKind};
use tidesql_core::{Columns, Result, Row, StatementInfo, Value};

/// What a rewritten step contributes to the logical statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// Runs before the primary statement.
    Setup,
    /// The user's statement; rows and column metadata come from here.
    Primary,
    /// A write repeated against another table.
    Mirror,
    /// Must produce no rows, otherwise the whole statement fails.
    ExpectEmpty,
    /// Runs last.
    Cleanup,
}

/// One SQL text of a rewritten statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteStep {
    pub sql: String,
    pub role: StepRole,
    /// Receives the caller's bound parameters (same indexes as the original).
    pub binds_parameters: bool,
    /// Constraint message raised when an `ExpectEmpty` step yields a row.
    pub failure: Option<String>,
}

impl RewriteStep {
    pub fn new(sql: impl Into<String>, role: StepRole) -> Self {
        Self {
            sql: sql.into(),
            role,
            binds_parameters: false,
            failure: None,
        }
    }

    pub fn with_parameters(mut self) -> Self {
        self.binds_parameters = true;
        self
    }

    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

/// The result of rewriting a statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewrite {
    /// Executed once per handle before the first use of any step.
    pub prerequisites: Vec<String>,
    pub steps: Vec<RewriteStep>,
}

/// Rewrites statements before they are compiled on a handle.
///
/// Implementations must be pure with respect to their current snapshot:
/// the same SQL text and generation always produce the same rewrite.
pub trait StatementRewriter: Send + Sync {
    /// Changes whenever rewrites could differ; cached statements compiled
    /// under an older generation are discarded.
    fn generation(&self) -> u64;

    /// False when no statement can be affected, letting prepare skip scanning.
    fn is_active(&self) -> bool;

    /// `Ok(None)` leaves the statement untouched.
    fn rewrite(&self, sql: &str, info: &StatementInfo) -> Result<Option<Rewrite>>;
}

pub(crate) struct CompiledStep {
    stmt: *mut ffi::sqlite3_stmt,
    sql: String,
    role: StepRole,
    binds_parameters: bool,
    failure: Option<String>,
}

/// One logical statement compiled on a handle.
pub struct HandleStatement {
    sql: String,
    steps: Vec<CompiledStep>,
    primary: usize,
    columns: Option<Arc<Columns>>,
}

// SAFETY: the raw statements are only used by the thread holding the
// PreparedStatement, or under the owning handle's mutex while cached.
unsafe impl Send for HandleStatement {}

impl HandleStatement {
    pub(crate) fn compile(
        db: *mut ffi::sqlite3,
        sql: &str,
        rewrite: Option<Rewrite>,
    ) -> Result<Self> {
        let mut statement = Self {
            sql: sql.to_string(),
            steps: Vec::new(),
            primary: 0,
            columns: None,
        };
        let steps = match rewrite {
            Some(rewrite) if !rewrite.steps.is_empty() => rewrite.steps,
            _ => vec![RewriteStep::new(sql, StepRole::Primary).with_parameters()],
        };
        for step in steps {
            let stmt = prepare_raw(db, &step.sql)?;
            if step.role == StepRole::Primary {
                statement.primary = statement.steps.len();
            }
            statement.steps.push(CompiledStep {
                stmt,
                sql: step.sql,
                role: step.role,
                binds_parameters: step.binds_parameters,
                failure: step.failure,
            });
        }
        Ok(statement)
    }

    /// The original (unrewritten) SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// SQL texts actually compiled, in execution order.
    pub fn compiled_sql(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.sql.as_str())
    }

    pub fn is_composite(&self) -> bool {
        self.steps.len() > 1
    }

    fn primary_stmt(&self) -> *mut ffi::sqlite3_stmt {
        self.steps[self.primary].stmt
    }

    pub(crate) fn reset(&self) {
        for step in &self.steps {
            // SAFETY: stmt is valid until Drop
            unsafe { ffi::sqlite3_reset(step.stmt) };
        }
    }

    pub(crate) fn clear_bindings(&self) {
        for step in &self.steps {
            // SAFETY: stmt is valid until Drop
            unsafe { ffi::sqlite3_clear_bindings(step.stmt) };
        }
    }

    /// Run every step to completion inside a savepoint. Returns the number of
    /// rows changed by the primary and mirrored steps.
    fn run_composite(&self, db: *mut ffi::sqlite3) -> Result<i64> {
        exec(db, "SAVEPOINT tidesql_rewrite")?;
        let outcome = self.run_steps(db);
        self.reset();
        match outcome {
            Ok(changes) => {
                exec(db, "RELEASE tidesql_rewrite")?;
                Ok(changes)
            }
            Err(err) => {
                let _ = exec(db, "ROLLBACK TO tidesql_rewrite");
                let _ = exec(db, "RELEASE tidesql_rewrite");
                Err(err)
            }
        }
    }

    fn run_steps(&self, db: *mut ffi::sqlite3) -> Result<i64> {
        let mut changes = 0_i64;
        for step in &self.steps {
            // SAFETY: stmt and db are valid
            let rc = unsafe { ffi::sqlite3_step(step.stmt) };
            match (rc, step.role) {
                (ffi::SQLITE_ROW, StepRole::ExpectEmpty) => {
                    return Err(Error::Sql(SqlError {
                        kind: SqlErrorKind::Constraint,
                        code: ffi::SQLITE_CONSTRAINT,
                        extended_code: ffi::SQLITE_CONSTRAINT_PRIMARYKEY,
                        message: step
                            .failure
                            .clone()
                            .unwrap_or_else(|| "constraint failed".to_string()),
                        sql: Some(self.sql.clone()),
                    }));
                }
                (ffi::SQLITE_ROW, _) => {
                    // Drain; composite statements never surface rows.
                    loop {
                        // SAFETY: as above
                        let rc = unsafe { ffi::sqlite3_step(step.stmt) };
                        if rc == ffi::SQLITE_DONE {
                            break;
                        }
                        if rc != ffi::SQLITE_ROW {
                            return Err(engine_error(db, rc, Some(&step.sql)));
                        }
                    }
                }
                (ffi::SQLITE_DONE, _) => {}
                (rc, _) => return Err(engine_error(db, rc, Some(&step.sql))),
            }
            if matches!(step.role, StepRole::Primary | StepRole::Mirror) {
                // SAFETY: db is valid
                changes += i64::from(unsafe { ffi::sqlite3_changes(db) });
            }
        }
        Ok(changes)
    }
}

impl Drop for HandleStatement {
    fn drop(&mut self) {
        for step in &self.steps {
            // SAFETY: each stmt was produced by prepare and is finalized once
            unsafe { ffi::sqlite3_finalize(step.stmt) };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Fresh,
    Row,
    Done,
}

/// A statement checked out of a handle for binding, stepping and extraction.
pub struct PreparedStatement<'h> {
    handle: &'h Handle,
    statement: Option<HandleStatement>,
    /// Cache generation to return under; `None` finalizes on drop.
    generation: Option<u64>,
    state: StepState,
}

impl<'h> PreparedStatement<'h> {
    pub(crate) fn new(
        handle: &'h Handle,
        statement: HandleStatement,
        generation: Option<u64>,
    ) -> Self {
        Self {
            handle,
            statement: Some(statement),
            generation,
            state: StepState::Fresh,
        }
    }

    fn statement(&self) -> Result<&HandleStatement> {
        self.statement
            .as_ref()
            .ok_or_else(|| Error::misuse("statement already finalized"))
    }

    pub fn is_prepared(&self) -> bool {
        self.statement.is_some()
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        self.statement.as_ref().map_or("", |s| s.sql.as_str())
    }

    /// Whether the statement was expanded by a rewriter.
    pub fn is_rewritten(&self) -> bool {
        self.statement
            .as_ref()
            .is_some_and(|s| s.is_composite() || s.steps[s.primary].sql != s.sql)
    }

    /// Advance the statement. `Ok(true)` means a row is available.
    pub fn step(&mut self) -> Result<bool> {
        if self.state == StepState::Done {
            return Ok(false);
        }
        let statement = self.statement()?;
        let outcome = self.handle.with_db(|db, changes| {
            if statement.is_composite() {
                let total = statement.run_composite(db)?;
                *changes = Some(total);
                Ok(false)
            } else {
                *changes = None;
                let stmt = statement.primary_stmt();
                // SAFETY: stmt and db are valid
                match unsafe { ffi::sqlite3_step(stmt) } {
                    ffi::SQLITE_ROW => Ok(true),
                    ffi::SQLITE_DONE => Ok(false),
                    rc => {
                        let err = engine_error(db, rc, Some(&statement.sql));
                        // SAFETY: stmt is valid
                        unsafe { ffi::sqlite3_reset(stmt) };
                        Err(err)
                    }
                }
            }
        });
        self.state = match outcome {
            Ok(true) => StepState::Row,
            _ => StepState::Done,
        };
        outcome
    }

    /// Step to completion, discarding rows.
    pub fn run(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Rewind so the statement can be stepped again. Bindings are kept.
    pub fn reset(&mut self) {
        if let Some(statement) = &self.statement {
            statement.reset();
        }
        self.state = StepState::Fresh;
    }

    /// True after the statement ran to completion (or failed).
    pub fn done(&self) -> bool {
        self.state == StepState::Done
    }

    /// Finalize now instead of returning to the handle's cache.
    pub fn finalize(mut self) {
        self.statement = None;
    }

    /// True when no step writes to the database.
    pub fn is_readonly(&self) -> bool {
        self.statement.as_ref().is_some_and(|s| {
            s.steps
                .iter()
                // SAFETY: stmt is valid
                .all(|step| unsafe { ffi::sqlite3_stmt_readonly(step.stmt) } != 0)
        })
    }

    fn bind_with(
        &self,
        index: usize,
        bind: impl Fn(*mut ffi::sqlite3_stmt, c_int) -> c_int,
    ) -> Result<()> {
        let statement = self.statement()?;
        let c_index = match c_int::try_from(index) {
            Ok(i) if i > 0 => i,
            _ => return Err(out_of_range(index)),
        };
        for step in statement.steps.iter().filter(|s| s.binds_parameters) {
            let rc = bind(step.stmt, c_index);
            if rc == ffi::SQLITE_RANGE {
                return Err(out_of_range(index));
            }
            if rc != ffi::SQLITE_OK {
                return self
                    .handle
                    .with_db(|db, _| Err(engine_error(db, rc, Some(&statement.sql))));
            }
        }
        Ok(())
    }

    /// Bind a value to a 1-based parameter index.
    pub fn bind_value(&mut self, index: usize, value: &Value) -> Result<()> {
        // SAFETY: stmt is valid for the lifetime of the statement
        self.bind_with(index, |stmt, i| unsafe { types::bind_value(stmt, i, value) })
    }

    pub fn bind_null(&mut self, index: usize) -> Result<()> {
        // SAFETY: stmt is valid
        self.bind_with(index, |stmt, i| unsafe { ffi::sqlite3_bind_null(stmt, i) })
    }

    pub fn bind_i64(&mut self, index: usize, value: i64) -> Result<()> {
        // SAFETY: stmt is valid
        self.bind_with(index, |stmt, i| unsafe { ffi::sqlite3_bind_int64(stmt, i, value) })
    }

    pub fn bind_i32(&mut self, index: usize, value: i32) -> Result<()> {
        // SAFETY: stmt is valid
        self.bind_with(index, |stmt, i| unsafe { ffi::sqlite3_bind_int(stmt, i, value) })
    }

    pub fn bind_f64(&mut self, index: usize, value: f64) -> Result<()> {
        // SAFETY: stmt is valid
        self.bind_with(index, |stmt, i| unsafe { ffi::sqlite3_bind_double(stmt, i, value) })
    }

    pub fn bind_text(&mut self, index: usize, value: &str) -> Result<()> {
        // SAFETY: stmt is valid; SQLite copies the text
        self.bind_with(index, |stmt, i| unsafe { types::bind_text(stmt, i, value) })
    }

    pub fn bind_blob(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let owned = Value::Blob(value.to_vec());
        self.bind_value(index, &owned)
    }

    /// Bind `params` to parameters `1..=params.len()`.
    pub fn bind_all(&mut self, params: &[Value]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            self.bind_value(i + 1, param)?;
        }
        Ok(())
    }

    /// Index of a named parameter such as `:id`.
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        let statement = self.statement.as_ref()?;
        let c_name = std::ffi::CString::new(name).ok()?;
        // SAFETY: stmt is valid, name is NUL-terminated
        let index =
            unsafe { ffi::sqlite3_bind_parameter_index(statement.primary_stmt(), c_name.as_ptr()) };
        usize::try_from(index).ok().filter(|i| *i > 0)
    }

    pub fn column_count(&self) -> usize {
        self.statement.as_ref().map_or(0, |s| {
            // SAFETY: stmt is valid
            unsafe { ffi::sqlite3_column_count(s.primary_stmt()) as usize }
        })
    }

    fn column_stmt(&self, index: usize) -> Option<(*mut ffi::sqlite3_stmt, c_int)> {
        if index >= self.column_count() {
            return None;
        }
        let statement = self.statement.as_ref()?;
        Some((statement.primary_stmt(), index as c_int))
    }

    fn row_column(&self, index: usize) -> Option<(*mut ffi::sqlite3_stmt, c_int)> {
        if self.state != StepState::Row {
            return None;
        }
        self.column_stmt(index)
    }

    pub fn column_name(&self, index: usize) -> Option<String> {
        let (stmt, i) = self.column_stmt(index)?;
        // SAFETY: stmt valid, index in range
        unsafe { types::column_name(stmt, i) }
    }

    pub fn column_type(&self, index: usize) -> ColumnType {
        self.row_column(index).map_or(ColumnType::Null, |(stmt, i)| {
            // SAFETY: positioned on a row, index in range
            ColumnType::from_code(unsafe { ffi::sqlite3_column_type(stmt, i) })
        })
    }

    pub fn column_value(&self, index: usize) -> Value {
        self.row_column(index).map_or(Value::Null, |(stmt, i)| {
            // SAFETY: positioned on a row, index in range
            unsafe { types::read_column(stmt, i) }
        })
    }

    pub fn column_i64(&self, index: usize) -> i64 {
        self.row_column(index).map_or(0, |(stmt, i)| {
            // SAFETY: positioned on a row, index in range
            unsafe { ffi::sqlite3_column_int64(stmt, i) }
        })
    }

    pub fn column_i32(&self, index: usize) -> i32 {
        self.row_column(index).map_or(0, |(stmt, i)| {
            // SAFETY: positioned on a row, index in range
            unsafe { ffi::sqlite3_column_int(stmt, i) }
        })
    }

    pub fn column_f64(&self, index: usize) -> f64 {
        self.row_column(index).map_or(0.0, |(stmt, i)| {
            // SAFETY: positioned on a row, index in range
            unsafe { ffi::sqlite3_column_double(stmt, i) }
        })
    }

    pub fn column_text(&self, index: usize) -> Option<String> {
        let (stmt, i) = self.row_column(index)?;
        // SAFETY: positioned on a row, index in range
        unsafe { types::read_text(stmt, i) }
    }

    pub fn column_blob(&self, index: usize) -> Vec<u8> {
        self.row_column(index).map_or_else(Vec::new, |(stmt, i)| {
            // SAFETY: positioned on a row, index in range
            unsafe { types::read_blob(stmt, i) }
        })
    }

    fn columns(&mut self) -> Arc<Columns> {
        if let Some(columns) = self.statement.as_ref().and_then(|s| s.columns.clone()) {
            return columns;
        }
        let names = (0..self.column_count())
            .map(|i| self.column_name(i).unwrap_or_else(|| format!("col{}", i)))
            .collect();
        let columns = Arc::new(Columns::new(names));
        if let Some(statement) = self.statement.as_mut() {
            statement.columns = Some(Arc::clone(&columns));
        }
        columns
    }

    /// The current row.
    pub fn row(&mut self) -> Row {
        let columns = self.columns();
        let values = (0..columns.len()).map(|i| self.column_value(i)).collect();
        Row::with_columns(columns, values)
    }

    /// Step through every remaining row.
    pub fn all_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.step()? {
            rows.push(self.row());
        }
        Ok(rows)
    }

    /// Values of one column across every remaining row.
    pub fn all_values(&mut self, index: usize) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while self.step()? {
            values.push(self.column_value(index));
        }
        Ok(values)
    }
}

impl Drop for PreparedStatement<'_> {
    fn drop(&mut self) {
        if let (Some(statement), Some(generation)) = (self.statement.take(), self.generation) {
            self.handle.recycle_statement(statement, generation);
        }
    }
}

fn out_of_range(index: usize) -> Error {
    Error::Handle(HandleError {
        kind: HandleErrorKind::OutOfRange,
        message: format!("parameter index {} out of range", index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tidesql_core::StatementKind;

    /// Copies every INSERT into `audit`, and refuses negative values.
    struct AuditRewriter {
        generation: AtomicU64,
    }

    impl StatementRewriter for AuditRewriter {
        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }

        fn is_active(&self) -> bool {
            true
        }

        fn rewrite(&self, sql: &str, info: &StatementInfo) -> Result<Option<Rewrite>> {
            if info.kind != StatementKind::Insert {
                return Ok(None);
            }
            Ok(Some(Rewrite {
                prerequisites: vec!["CREATE TEMP TABLE IF NOT EXISTS audit (x)".to_string()],
                steps: vec![
                    RewriteStep::new(sql, StepRole::Primary).with_parameters(),
                    RewriteStep::new("INSERT INTO temp.audit VALUES (?1)", StepRole::Mirror)
                        .with_parameters(),
                    RewriteStep::new("SELECT 1 FROM main.t WHERE x < 0", StepRole::ExpectEmpty)
                        .failing_with("negative value"),
                ],
            }))
        }
    }

    fn audited() -> (Handle, Arc<AuditRewriter>) {
        let handle = Handle::open_memory().unwrap();
        handle.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();
        let rewriter = Arc::new(AuditRewriter {
            generation: AtomicU64::new(1),
        });
        handle.set_rewriter(Some(rewriter.clone()));
        (handle, rewriter)
    }

    fn count(handle: &Handle, table: &str) -> i64 {
        handle
            .query_value(&format!("SELECT count(*) FROM {}", table), &[])
            .unwrap()
            .and_then(|v| v.as_i64())
            .unwrap()
    }

    #[test]
    fn composite_write_runs_every_step() {
        let (handle, _) = audited();
        let mut stmt = handle.prepare("INSERT INTO t VALUES (?)").unwrap();
        assert!(stmt.is_rewritten());
        assert!(!stmt.is_readonly());
        stmt.bind_i64(1, 5).unwrap();
        assert!(!stmt.step().unwrap());
        assert!(stmt.done());
        drop(stmt);

        assert_eq!(handle.changes(), 2);
        assert_eq!(count(&handle, "main.t"), 1);
        assert_eq!(count(&handle, "temp.audit"), 1);
    }

    #[test]
    fn expect_empty_step_rolls_back_everything() {
        let (handle, _) = audited();
        let err = handle
            .execute_with("INSERT INTO t VALUES (?)", &[Value::Integer(-1)])
            .unwrap_err();
        assert!(err.is_constraint());
        assert!(err.to_string().contains("negative value"));
        assert_eq!(count(&handle, "main.t"), 0);
        assert_eq!(count(&handle, "temp.audit"), 0);
        assert!(!handle.is_in_transaction());
    }

    #[test]
    fn composite_write_nests_inside_transaction() {
        let (handle, _) = audited();
        handle.begin_transaction().unwrap();
        handle
            .execute_with("INSERT INTO t VALUES (?)", &[Value::Integer(1)])
            .unwrap();
        assert!(
            handle
                .execute_with("INSERT INTO t VALUES (?)", &[Value::Integer(-1)])
                .is_err()
        );
        handle.commit_transaction().unwrap();
        assert_eq!(count(&handle, "main.t"), 1);
    }

    #[test]
    fn reads_are_not_rewritten() {
        let (handle, _) = audited();
        let stmt = handle.prepare("SELECT * FROM t").unwrap();
        assert!(!stmt.is_rewritten());
        assert_eq!(stmt.sql(), "SELECT * FROM t");
    }

    #[test]
    fn generation_change_discards_cache() {
        let (handle, rewriter) = audited();
        handle.execute("SELECT * FROM t").unwrap();
        assert_eq!(handle.cached_statement_count(), 1);

        let stale = handle.prepare("SELECT x FROM t").unwrap();
        rewriter.generation.fetch_add(1, Ordering::SeqCst);
        handle.execute("SELECT * FROM t").unwrap();
        drop(stale);
        // Only the statement compiled under the new generation survives.
        assert_eq!(handle.cached_statement_count(), 1);
    }

    #[test]
    fn finalize_skips_cache() {
        let (handle, _) = audited();
        let stmt = handle.prepare("SELECT * FROM t").unwrap();
        stmt.finalize();
        assert_eq!(handle.cached_statement_count(), 0);
    }

    #[test]
    fn direct_statements_bypass_rewriter_and_cache() {
        let (handle, _) = audited();
        let mut stmt = handle.prepare_direct("INSERT INTO t VALUES (?)").unwrap();
        assert!(!stmt.is_rewritten());
        stmt.bind_i64(1, -7).unwrap();
        stmt.run().unwrap();
        drop(stmt);
        assert_eq!(handle.cached_statement_count(), 0);
        assert_eq!(count(&handle, "main.t"), 1);
        // The audit prerequisite never ran.
        assert!(!handle.table_exists_in("temp", "audit").unwrap());
    }

    #[test]
    fn prerequisites_run_once_per_handle() {
        let handle = Handle::open_memory().unwrap();
        let sql = "CREATE TEMP TABLE once (x)";
        handle.ensure_prerequisite(sql).unwrap();
        handle.ensure_prerequisite(sql).unwrap();
        assert!(handle.table_exists_in("temp", "once").unwrap());
    }
}
