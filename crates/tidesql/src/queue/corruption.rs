//! Integrity check and repair of databases that reported corruption.

use crate::notifier::{CorruptionEvent, CorruptionOutcome};
use crate::registry::Core;
use super::backup::backup_path;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidesql_core::{Result, Value};
use tidesql_pool::{InnerDatabase, Intent};
use tidesql_sqlite::{Handle, HandleConfig, OpenFlags};

pub(crate) const NAME: &str = "corruption";

/// Files SQLite keeps next to a database.
const SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

pub(crate) fn run(core: &Core, path: &str) -> Option<Duration> {
    let inner = Arc::clone(&core.state(path)?.inner);
    let retry = core.config().corruption.retry_delay;
    let message = match quick_check(&inner) {
        Ok(None) => {
            tracing::debug!(path, "integrity check passed");
            return None;
        }
        Ok(Some(message)) => message,
        Err(err) if err.is_retryable() => return Some(retry),
        Err(err) => {
            tracing::warn!(path, error = %err, "integrity check could not run");
            return None;
        }
    };
    tracing::warn!(path, message = %message, "database failed integrity check");
    let outcome = match inner.close(|| restore_or_quarantine(path)) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::debug!(path, error = %err, "repair postponed");
            return Some(retry);
        }
    };
    let event = CorruptionEvent {
        path: path.to_string(),
        message,
        outcome,
    };
    tracing::warn!(path, outcome = ?event.outcome, "corruption handled");
    core.notifier().corruption().dispatch(&event);
    None
}

/// `None` when the database is healthy, otherwise the first problem found.
pub(crate) fn quick_check(inner: &InnerDatabase) -> Result<Option<String>> {
    // A file too damaged to configure fails before the pragma runs.
    let checked = inner
        .acquire(Intent::Exclusive)
        .and_then(|handle| check_handle(&handle));
    match checked {
        Err(err) if err.is_corruption() => Ok(Some(err.to_string())),
        other => other,
    }
}

fn check_handle(handle: &Handle) -> Result<Option<String>> {
    let rows = handle.query_direct("PRAGMA quick_check", &[])?;
    let first = rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(Value::as_str)
        .unwrap_or("no result from integrity check");
    if rows.len() == 1 && first.eq_ignore_ascii_case("ok") {
        Ok(None)
    } else {
        Ok(Some(first.to_string()))
    }
}

fn is_healthy(file: &Path) -> bool {
    let config = HandleConfig::file(file.to_string_lossy()).flags(OpenFlags::read_only());
    Handle::open_with(config)
        .and_then(|handle| check_handle(&handle))
        .is_ok_and(|problem| problem.is_none())
}

/// Runs while every handle to `path` is closed.
#[tracing::instrument(level = "debug", skip_all, fields(path = %path))]
fn restore_or_quarantine(path: &str) -> CorruptionOutcome {
    let backup = backup_path(path);
    if backup.exists() && is_healthy(&backup) {
        return match restore(path, &backup) {
            Ok(()) => CorruptionOutcome::Restored { backup },
            Err(err) => CorruptionOutcome::Failed {
                reason: format!("restore from {} failed: {err}", backup.display()),
            },
        };
    }
    match quarantine(path) {
        Ok(moved_to) => CorruptionOutcome::Quarantined { moved_to },
        Err(err) => CorruptionOutcome::Failed {
            reason: format!("quarantine failed: {err}"),
        },
    }
}

fn restore(path: &str, backup: &Path) -> std::io::Result<()> {
    let staging = PathBuf::from(format!("{path}.restore.tmp"));
    std::fs::copy(backup, &staging)?;
    for suffix in SIDECARS {
        remove_if_present(&PathBuf::from(format!("{path}{suffix}")))?;
    }
    std::fs::rename(&staging, path)
}

fn quarantine(path: &str) -> std::io::Result<PathBuf> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    let moved_to = PathBuf::from(format!("{path}.corrupt-{millis}"));
    std::fs::rename(path, &moved_to)?;
    for suffix in SIDECARS {
        let sidecar = PathBuf::from(format!("{path}{suffix}"));
        if sidecar.exists() {
            let mut target = moved_to.clone().into_os_string();
            target.push(suffix);
            std::fs::rename(&sidecar, PathBuf::from(target))?;
        }
    }
    Ok(moved_to)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
