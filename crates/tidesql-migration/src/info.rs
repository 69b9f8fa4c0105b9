//! Migration descriptions.
//!
//! A [`MigrationBaseInfo`] is what the caller registers: move the rows of
//! `source_table` (optionally in another file, optionally only those matching
//! `filter`) into `table`. Registration resolves it into a [`MigrationInfo`]
//! carrying the derived names and the column list every generated statement
//! uses.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tidesql_core::error::{MigrationError, MigrationErrorKind};
use tidesql_core::sql::{TokenKind, tokenize};
use tidesql_core::{Error, Result, quote_ident, quote_literal, quote_qualified};

/// Prefix of the schema a separate source file is attached under.
pub const SOURCE_SCHEMA_PREFIX: &str = "tidesql_migration_";
/// Prefix of the per-table union view.
pub const UNION_VIEW_PREFIX: &str = "tidesql_union_";

/// A requested migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationBaseInfo {
    /// Table the rows end up in (the logical name callers use).
    pub table: String,
    pub source_table: String,
    /// `None` when the source lives in the same file.
    pub source_database: Option<PathBuf>,
    /// SQL expression selecting the rows that belong to `table`.
    pub filter: Option<String>,
}

impl MigrationBaseInfo {
    pub fn new(table: impl Into<String>, source_table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_table: source_table.into(),
            source_database: None,
            filter: None,
        }
    }

    /// Read the source table from another database file.
    pub fn from_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_database = Some(path.into());
        self
    }

    /// Only migrate rows matching `expression`.
    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filter = Some(expression.into());
        self
    }

    pub fn is_cross_database(&self) -> bool {
        self.source_database.is_some()
    }

    /// Reject descriptions no statement could be generated from.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() || self.source_table.trim().is_empty() {
            return Err(invalid(&self.table, "table names must not be empty"));
        }
        if !self.is_cross_database() && self.table.eq_ignore_ascii_case(&self.source_table) {
            return Err(invalid(
                &self.table,
                "source and target are the same table in the same file",
            ));
        }
        if let Some(filter) = &self.filter {
            let tokens = tokenize(filter);
            if tokens.iter().any(|t| t.kind == TokenKind::Parameter) {
                return Err(invalid(&self.table, "filter must not contain bound parameters"));
            }
            if tokens.iter().any(|t| t.kind == TokenKind::Punct && t.text == ";") {
                return Err(invalid(&self.table, "filter must be a single expression"));
            }
            if filter.trim().is_empty() {
                return Err(invalid(&self.table, "filter must not be empty"));
            }
        }
        Ok(())
    }

    /// Schema the source is reachable under on a handle.
    pub fn schema_name(&self) -> String {
        match &self.source_database {
            Some(path) => format!("{}{:016x}", SOURCE_SCHEMA_PREFIX, fnv1a(path)),
            None => "main".to_string(),
        }
    }
}

fn invalid(table: &str, message: &str) -> Error {
    Error::Migration(MigrationError {
        kind: MigrationErrorKind::InvalidSource,
        table: table.to_string(),
        message: message.to_string(),
        source: None,
    })
}

/// Stable across processes, unlike the std hasher.
fn fnv1a(path: &Path) -> u64 {
    path.to_string_lossy()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
}

/// A registered migration with everything statement generation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    base: MigrationBaseInfo,
    schema: String,
    columns: Vec<String>,
    integer_primary_key: bool,
}

impl MigrationInfo {
    pub fn new(base: MigrationBaseInfo, columns: Vec<String>, integer_primary_key: bool) -> Self {
        let schema = base.schema_name();
        Self {
            base,
            schema,
            columns,
            integer_primary_key,
        }
    }

    pub fn base(&self) -> &MigrationBaseInfo {
        &self.base
    }

    pub fn table(&self) -> &str {
        &self.base.table
    }

    pub fn source_table(&self) -> &str {
        &self.base.source_table
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The target's rowid is one of the migrated columns.
    pub fn has_integer_primary_key(&self) -> bool {
        self.integer_primary_key
    }

    /// Does `name` (as written in an unqualified or `main.` reference) denote
    /// this migration's logical table?
    pub fn is_logical_name(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.base.table)
            || (!self.base.is_cross_database() && name.eq_ignore_ascii_case(&self.base.source_table))
    }

    pub fn qualified_table(&self) -> String {
        quote_qualified("main", &self.base.table)
    }

    pub fn qualified_source(&self) -> String {
        quote_qualified(&self.schema, &self.base.source_table)
    }

    pub fn view_name(&self) -> String {
        format!("{}{}", UNION_VIEW_PREFIX, self.base.table)
    }

    pub fn qualified_view(&self) -> String {
        quote_qualified("temp", &self.view_name())
    }

    /// The filter as a parenthesized predicate (`1` when unfiltered).
    pub fn predicate(&self) -> String {
        match &self.base.filter {
            Some(filter) => format!("({})", filter),
            None => "1".to_string(),
        }
    }

    /// Quoted, comma-separated migrated columns.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Column list that carries rowids across, for `INSERT INTO target(..)`
    /// and the matching `SELECT ..`.
    pub fn copy_columns(&self) -> String {
        if self.integer_primary_key {
            self.column_list()
        } else {
            format!("rowid, {}", self.column_list())
        }
    }

    pub fn attach_sql(&self) -> Option<String> {
        self.base.source_database.as_ref().map(|path| {
            format!(
                "ATTACH DATABASE {} AS {}",
                quote_literal(&path.to_string_lossy()),
                quote_ident(&self.schema)
            )
        })
    }

    /// Source rows (still eligible) followed by target rows.
    pub fn create_view_sql(&self) -> String {
        let columns = self.column_list();
        format!(
            "CREATE TEMP VIEW IF NOT EXISTS {view} AS SELECT {columns} FROM {source} WHERE {predicate} UNION ALL SELECT {columns} FROM {target}",
            view = self.qualified_view(),
            source = self.qualified_source(),
            predicate = self.predicate(),
            target = self.qualified_table(),
        )
    }

    /// Statements a handle must have run before any rewritten statement.
    pub fn prerequisites(&self) -> Vec<String> {
        self.attach_sql()
            .into_iter()
            .chain(std::iter::once(self.create_view_sql()))
            .collect()
    }
}

/// Where a migration stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Migrating,
    /// Stopped after a non-transient failure until resumed.
    Paused { reason: String },
    Done,
}

/// Per-table progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub table: String,
    pub source_table: String,
    pub source_database: Option<PathBuf>,
    #[serde(flatten)]
    pub state: MigrationState,
    pub rows_migrated: u64,
    pub batches: u64,
}
