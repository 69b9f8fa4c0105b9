use crate::database::Database;
use crate::registry::Core;
use std::sync::Arc;
use std::time::Duration;
use tidesql_core::Error;
use tidesql_core::error::MigrationErrorKind;

pub(crate) const NAME: &str = "migration";

/// Move one batch for `path` while auto-migration stays enabled and some
/// mapping can still make progress.
pub(crate) fn run(core: &Arc<Core>, path: &str) -> Option<Duration> {
    let state = core.state(path)?;
    if !state.is_auto_migrate() {
        return None;
    }
    let database = Database::from_state(Arc::clone(core), state);
    let config = core.config().migration;
    match database.step_migration() {
        Ok(Some(report)) if report.done && !database.has_runnable_migration() => {
            tracing::info!(path, table = %report.table, "background migration finished");
            None
        }
        Ok(Some(_)) => Some(config.delay),
        Ok(None) => None,
        Err(err) if err.is_retryable() => Some(config.retry_delay),
        Err(Error::Migration(err)) if err.kind == MigrationErrorKind::Paused => {
            database.has_runnable_migration().then_some(config.delay)
        }
        Err(err) => {
            tracing::warn!(path, error = %err, "background migration step failed");
            Some(config.retry_delay)
        }
    }
}
