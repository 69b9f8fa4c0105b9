use crate::registry::Core;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tidesql_core::Result;
use tidesql_pool::{InnerDatabase, Intent};

pub(crate) const NAME: &str = "backup";

/// Where the last good copy of `path` lives.
pub fn backup_path(path: &str) -> PathBuf {
    PathBuf::from(format!("{path}.bak"))
}

fn staging_path(path: &str) -> PathBuf {
    PathBuf::from(format!("{path}.bak.tmp"))
}

/// Only named files can be copied aside.
pub(crate) fn is_backed_by_file(path: &str) -> bool {
    path != ":memory:" && !path.starts_with("file:")
}

pub(crate) fn run(core: &Core, path: &str) -> Option<Duration> {
    let state = core.state(path)?;
    if !state.is_auto_backup() {
        return None;
    }
    let config = core.config().backup;
    match backup(&state.inner) {
        Ok(target) => {
            tracing::debug!(path, backup = %target.display(), "backed up");
            Some(config.delay)
        }
        Err(err) if err.is_retryable() => Some(config.retry_delay),
        Err(err) => {
            tracing::warn!(path, error = %err, "backup failed");
            Some(config.delay)
        }
    }
}

/// Copy the database to its backup path. The copy is written beside the
/// final name and renamed into place, so a crash never leaves a truncated
/// backup behind.
#[tracing::instrument(level = "debug", skip_all, fields(path = %inner.path()))]
pub(crate) fn backup(inner: &InnerDatabase) -> Result<PathBuf> {
    let path = inner.path();
    let staging = staging_path(path);
    match std::fs::remove_file(&staging) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    {
        let handle = inner.acquire(Intent::Read)?;
        handle.vacuum_into(&staging.to_string_lossy())?;
    }
    let target = backup_path(path);
    std::fs::rename(&staging, &target)?;
    Ok(target)
}
