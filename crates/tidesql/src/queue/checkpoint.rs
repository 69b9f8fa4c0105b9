use crate::registry::Core;
use std::sync::Arc;
use std::time::Duration;
use tidesql_pool::Intent;
use tidesql_sqlite::CheckpointMode;

pub(crate) const NAME: &str = "checkpoint";

/// Checkpoint the WAL of `path`. Small logs get a `PASSIVE` pass that never
/// waits on readers; logs past the configured frame count are truncated.
pub(crate) fn run(core: &Core, path: &str) -> Option<Duration> {
    let frames = core.take_wal_frames(path);
    let inner = Arc::clone(&core.state(path)?.inner);
    let mode = if frames >= core.config().checkpoint_truncate_frames {
        CheckpointMode::Truncate
    } else {
        CheckpointMode::Passive
    };
    let handle = match inner.acquire(Intent::Read) {
        Ok(handle) => handle,
        Err(err) => {
            tracing::debug!(path, error = %err, "checkpoint skipped");
            return None;
        }
    };
    match handle.checkpoint(mode) {
        Ok(result) => {
            tracing::debug!(
                path,
                ?mode,
                log_frames = result.log_frames,
                checkpointed = result.checkpointed_frames,
                "checkpointed"
            );
            None
        }
        Err(err) if err.is_retryable() => {
            core.restore_wal_frames(path, frames);
            tracing::debug!(path, ?mode, "checkpoint busy, rescheduling");
            Some(core.config().checkpoint.retry_delay)
        }
        Err(err) => {
            tracing::warn!(path, ?mode, error = %err, "checkpoint failed");
            None
        }
    }
}
