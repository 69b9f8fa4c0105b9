//! Statement rewriting against migrating tables.
//!
//! While a table is migrating its rows live in two places: the unmigrated
//! (eligible) rows of the source and the migrated rows of the target. Reads
//! of the logical name go through a temporary union view over both; writes
//! run against the target and are mirrored or reconciled against the source
//! so every row exists in exactly one place at every commit.
//!
//! [`rewrite`] is a pure function of the statement and a snapshot, so the
//! result can be cached per handle until the snapshot generation changes.

use crate::info::MigrationInfo;
use crate::mapping::{MappingSnapshot, Resolution};
use std::ops::Range;
use std::sync::Arc;
use tidesql_core::error::{Error, MigrationError, MigrationErrorKind};
use tidesql_core::sql::{ConflictMode, TableRef, TableRole, splice};
use tidesql_core::{Result, StatementInfo, StatementKind, quote_ident, quote_qualified};
use tidesql_sqlite::{Rewrite, RewriteStep, StepRole};

type Edit = (Range<usize>, String);

/// Rewrite `sql` for the migrations in `snapshot`. `Ok(None)` means the
/// statement touches no migrating or renamed table and runs as written.
pub fn rewrite(
    sql: &str,
    statement: &StatementInfo,
    snapshot: &MappingSnapshot,
) -> Result<Option<Rewrite>> {
    if snapshot.is_inert()
        || !matches!(
            statement.kind,
            StatementKind::Select
                | StatementKind::Insert
                | StatementKind::Update
                | StatementKind::Delete
        )
    {
        return Ok(None);
    }

    let mut prerequisites: Vec<String> = Vec::new();
    let mut reads: Vec<Edit> = Vec::new();
    let mut target: Option<(&TableRef, &Arc<MigrationInfo>)> = None;
    for table in &statement.tables {
        if !table.is_main() {
            continue;
        }
        let info = match snapshot.resolve(&table.name) {
            None => continue,
            Some(Resolution::Renamed(renamed)) => {
                reads.push((table.span.clone(), rename_replacement(table, renamed, statement.kind)));
                continue;
            }
            Some(Resolution::Migrating(info)) => info,
        };
        for prerequisite in info.prerequisites() {
            if !prerequisites.contains(&prerequisite) {
                prerequisites.push(prerequisite);
            }
        }
        match table.role {
            TableRole::Write => target = Some((table, info)),
            TableRole::Read => reads.push((table.span.clone(), read_replacement(table, info))),
        }
    }

    let Some((target, info)) = target else {
        if reads.is_empty() {
            return Ok(None);
        }
        return Ok(Some(Rewrite {
            prerequisites,
            steps: vec![RewriteStep::new(splice(sql, reads), StepRole::Primary).with_parameters()],
        }));
    };

    if statement.returning {
        return Err(unsupported(info, "RETURNING is not supported while the table migrates"));
    }
    if statement.upsert {
        return Err(unsupported(info, "ON CONFLICT upserts are not supported while the table migrates"));
    }

    let steps = match statement.kind {
        StatementKind::Insert => insert_steps(sql, statement, target, info, reads),
        _ => mirrored_steps(sql, statement, target, info, reads),
    };
    Ok(Some(Rewrite {
        prerequisites,
        steps,
    }))
}

fn unsupported(info: &MigrationInfo, message: &str) -> Error {
    Error::Migration(MigrationError {
        kind: MigrationErrorKind::Unsupported,
        table: info.table().to_string(),
        message: message.to_string(),
        source: None,
    })
}

/// The union view, aliased to the name as written so qualified column
/// references keep resolving.
fn read_replacement(table: &TableRef, info: &MigrationInfo) -> String {
    if table.aliased {
        info.qualified_view()
    } else {
        format!("{} AS {}", info.qualified_view(), quote_ident(&table.name))
    }
}

/// The target of a finished migration, aliased to the name as written
/// except where it is the table an INSERT writes.
fn rename_replacement(table: &TableRef, renamed: &str, kind: StatementKind) -> String {
    let qualified = quote_qualified("main", renamed);
    if table.aliased || (table.role == TableRole::Write && kind == StatementKind::Insert) {
        qualified
    } else {
        format!("{} AS {}", qualified, quote_ident(&table.name))
    }
}

/// Lift, the statement itself, then conflict reconciliation.
fn insert_steps(
    sql: &str,
    statement: &StatementInfo,
    target: &TableRef,
    info: &MigrationInfo,
    mut edits: Vec<Edit>,
) -> Vec<RewriteStep> {
    let table = info.qualified_table();
    let source = info.qualified_source();
    let predicate = info.predicate();
    let copy = info.copy_columns();

    edits.push((target.span.clone(), table.clone()));
    let primary = splice(sql, edits);

    // Keep the target's highest rowid at or above every unmigrated one, so
    // rowids the engine assigns can never collide with a source row.
    let lift_copy = format!(
        "INSERT INTO {table}({copy}) SELECT {copy} FROM {source} \
         WHERE {predicate} AND rowid = (SELECT max(rowid) FROM {source} WHERE {predicate}) \
         AND rowid > coalesce((SELECT max(rowid) FROM {table}), -9223372036854775807)"
    );
    let lift_delete = format!(
        "DELETE FROM {source} \
         WHERE {predicate} AND rowid = (SELECT max(rowid) FROM {source} WHERE {predicate}) \
         AND EXISTS (SELECT 1 FROM {table} WHERE rowid = {source}.rowid)"
    );

    let mut steps = vec![
        RewriteStep::new(lift_copy, StepRole::Setup),
        RewriteStep::new(lift_delete, StepRole::Setup),
        RewriteStep::new(primary, StepRole::Primary).with_parameters(),
    ];
    let collisions = collisions(info);
    steps.push(match statement.conflict {
        // The new row wins; drop the unmigrated copy.
        ConflictMode::Replace => {
            RewriteStep::new(format!("DELETE FROM {collisions}"), StepRole::Cleanup)
        }
        // The unmigrated row wins; drop what was just inserted.
        ConflictMode::Ignore => RewriteStep::new(
            format!(
                "DELETE FROM {table} WHERE rowid IN (SELECT rowid FROM {source} WHERE {predicate})"
            ),
            StepRole::Cleanup,
        ),
        _ => collision_check(info),
    });
    steps
}

/// Eligible source rows whose rowid also exists in the target.
fn collisions(info: &MigrationInfo) -> String {
    let source = info.qualified_source();
    format!(
        "{source} WHERE {predicate} AND EXISTS (SELECT 1 FROM {table} WHERE rowid = {source}.rowid)",
        predicate = info.predicate(),
        table = info.qualified_table(),
    )
}

/// Fails the statement when a row now exists on both sides.
fn collision_check(info: &MigrationInfo) -> RewriteStep {
    RewriteStep::new(
        format!("SELECT 1 FROM {} LIMIT 1", collisions(info)),
        StepRole::ExpectEmpty,
    )
    .failing_with(format!("UNIQUE constraint failed: {}.rowid", info.table()))
}

/// The statement against the target, then the same statement against the
/// source restricted to eligible rows. Updates finish with the same
/// collision check as inserts.
fn mirrored_steps(
    sql: &str,
    statement: &StatementInfo,
    target: &TableRef,
    info: &MigrationInfo,
    reads: Vec<Edit>,
) -> Vec<RewriteStep> {
    let alias = if target.aliased || target.name.eq_ignore_ascii_case(info.table()) {
        String::new()
    } else {
        format!(" AS {}", quote_ident(&target.name))
    };
    let mut primary_edits = reads.clone();
    primary_edits.push((target.span.clone(), format!("{}{}", info.qualified_table(), alias)));
    let primary = splice(sql, primary_edits);

    let mirror_alias = if target.aliased {
        String::new()
    } else {
        format!(" AS {}", quote_ident(&target.name))
    };
    let mut mirror_edits = reads;
    mirror_edits.push((
        target.span.clone(),
        format!("{}{}", info.qualified_source(), mirror_alias),
    ));
    if info.base().filter.is_some() {
        let predicate = info.predicate();
        match &statement.where_clause {
            Some((keyword, end)) => {
                mirror_edits.push((keyword.end..keyword.end, format!(" {} AND (", predicate)));
                mirror_edits.push((*end..*end, ") ".to_string()));
            }
            None => {
                let at = statement.where_insert_at;
                mirror_edits.push((at..at, format!(" WHERE {} ", predicate)));
            }
        }
    }
    let mirror = splice(sql, mirror_edits);

    let mut steps = vec![
        RewriteStep::new(primary, StepRole::Primary).with_parameters(),
        RewriteStep::new(mirror, StepRole::Mirror).with_parameters(),
    ];
    // A changed rowid may now match a row on the other side.
    if statement.kind == StatementKind::Update {
        steps.push(collision_check(info));
    }
    steps
}
