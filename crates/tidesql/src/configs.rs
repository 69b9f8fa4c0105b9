//! Connection set-up steps installed by [`Core`](crate::Core).
//!
//! Every database starts from the core's default configs:
//!
//! | name | priority | effect |
//! |------|----------|--------|
//! | [`TraceConfig::NAME`] | `HIGHEST` | forwards statements and timings to the notifier |
//! | [`BasicConfig::NAME`] | `HIGHER` | WAL journal, `synchronous = NORMAL` |
//! | [`CheckpointConfig::NAME`] | `LOW` | feeds the checkpoint queue from WAL commits |
//!
//! [`BackupConfig`] and [`ModuleConfig`] are opt-in per database.

use crate::notifier::{ErrorEvent, PerformanceEvent, SqlTraceEvent};
use crate::queue::backup::is_backed_by_file;
use crate::registry::Core;
use std::sync::{Arc, Weak};
use tidesql_core::error::ConfigError;
use tidesql_core::{Error, Result, Value};
use tidesql_sqlite::{Config, Handle, TraceContext};

/// SQLite's own auto-checkpoint threshold, restored when the checkpoint
/// queue stops watching a handle.
const DEFAULT_WAL_AUTOCHECKPOINT: u32 = 1000;

/// WAL journal and relaxed syncing for file databases.
#[derive(Debug, Default)]
pub struct BasicConfig;

impl BasicConfig {
    pub const NAME: &'static str = "tidesql.basic";
}

impl Config for BasicConfig {
    fn invoke(&self, handle: &Handle) -> Result<()> {
        if handle.config().flags.read_only {
            return Ok(());
        }
        if is_backed_by_file(handle.path()) {
            let rows = handle.query_direct("PRAGMA journal_mode = WAL", &[])?;
            let mode = rows.first().and_then(|row| row.get(0)).and_then(Value::as_str);
            if !mode.is_some_and(|mode| mode.eq_ignore_ascii_case("wal")) {
                tracing::warn!(path = %handle.path(), ?mode, "WAL journal unavailable");
            }
        }
        handle.execute_raw("PRAGMA synchronous = NORMAL")
    }
}

/// Routes WAL commits of every handle to the checkpoint queue.
///
/// Installing a WAL hook replaces SQLite's built-in auto-checkpoint, so the
/// queue becomes the only thing keeping the log short.
pub struct CheckpointConfig {
    core: Weak<Core>,
}

impl CheckpointConfig {
    pub const NAME: &'static str = "tidesql.checkpoint";

    pub fn new(core: &Arc<Core>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }

    pub(crate) fn from_weak(core: Weak<Core>) -> Self {
        Self { core }
    }
}

impl Config for CheckpointConfig {
    fn invoke(&self, handle: &Handle) -> Result<()> {
        let core = self.core.clone();
        handle.set_wal_commit_hook(
            Self::NAME,
            Some(Arc::new(move |ctx: TraceContext<'_>, frames: u32| {
                if let Some(core) = core.upgrade() {
                    core.note_wal_commit(ctx.path, frames);
                }
            })),
        )
    }

    fn uninvoke(&self, handle: &Handle) -> Result<()> {
        handle.set_wal_commit_hook(Self::NAME, None)?;
        handle.execute_raw(&format!(
            "PRAGMA wal_autocheckpoint = {DEFAULT_WAL_AUTOCHECKPOINT}"
        ))
    }
}

/// Keeps the database scheduled on the backup queue.
pub struct BackupConfig {
    core: Weak<Core>,
}

impl BackupConfig {
    pub const NAME: &'static str = "tidesql.backup";

    pub fn new(core: &Arc<Core>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }
}

impl Config for BackupConfig {
    fn invoke(&self, handle: &Handle) -> Result<()> {
        if let Some(core) = self.core.upgrade() {
            if is_backed_by_file(handle.path()) {
                core.backup_queue()
                    .offer(handle.path(), core.config().backup.delay);
            }
        }
        Ok(())
    }
}

/// Forwards statement text and statement timings of every handle to the
/// core's notifier. Listeners are looked up per event, so listeners
/// registered later see statements of handles that are already open.
pub struct TraceConfig {
    core: Weak<Core>,
}

impl TraceConfig {
    pub const NAME: &'static str = "tidesql.trace";

    pub fn new(core: &Arc<Core>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }

    pub(crate) fn from_weak(core: Weak<Core>) -> Self {
        Self { core }
    }
}

impl Config for TraceConfig {
    fn invoke(&self, handle: &Handle) -> Result<()> {
        let core = self.core.clone();
        handle.set_trace_hook(
            Self::NAME,
            Some(Arc::new(move |ctx: TraceContext<'_>, sql: &str| {
                let Some(core) = core.upgrade() else { return };
                let listeners = core.notifier().sql_trace();
                if !listeners.is_empty() {
                    listeners.dispatch(&SqlTraceEvent::new(ctx, sql));
                }
            })),
        )?;
        let core = self.core.clone();
        handle.set_profile_hook(
            Self::NAME,
            Some(Arc::new(
                move |ctx: TraceContext<'_>, sql: &str, elapsed: std::time::Duration| {
                    let Some(core) = core.upgrade() else { return };
                    let listeners = core.notifier().performance();
                    if !listeners.is_empty() {
                        listeners.dispatch(&PerformanceEvent {
                            path: ctx.path.to_string(),
                            handle_id: ctx.handle_id,
                            tag: ctx.tag.map(str::to_string),
                            sql: sql.to_string(),
                            elapsed_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                        });
                    }
                },
            )),
        )
    }

    fn uninvoke(&self, handle: &Handle) -> Result<()> {
        handle.set_trace_hook(Self::NAME, None)?;
        handle.set_profile_hook(Self::NAME, None)
    }
}

/// Applies modules registered on the core by name, in the order given.
pub struct ModuleConfig {
    core: Weak<Core>,
    names: Vec<String>,
}

impl ModuleConfig {
    pub const NAME: &'static str = "tidesql.modules";

    pub fn new<I, S>(core: &Arc<Core>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            core: Arc::downgrade(core),
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn modules(&self) -> Result<Vec<(String, Arc<dyn Config>)>> {
        let core = self.core.upgrade().ok_or_else(|| {
            Error::Config(ConfigError {
                name: Some(Self::NAME.to_string()),
                message: "core has shut down".to_string(),
                source: None,
            })
        })?;
        self.names
            .iter()
            .map(|name| {
                core.module(name).map(|module| (name.clone(), module)).ok_or_else(|| {
                    Error::Config(ConfigError {
                        name: Some(Self::NAME.to_string()),
                        message: format!("module '{name}' is not registered"),
                        source: None,
                    })
                })
            })
            .collect()
    }
}

impl Config for ModuleConfig {
    fn invoke(&self, handle: &Handle) -> Result<()> {
        for (name, module) in self.modules()? {
            tracing::trace!(path = %handle.path(), module = %name, "enabling module");
            module.invoke(handle)?;
        }
        Ok(())
    }

    fn uninvoke(&self, handle: &Handle) -> Result<()> {
        for (_, module) in self.modules()?.into_iter().rev() {
            module.uninvoke(handle)?;
        }
        Ok(())
    }
}

/// Error observer installed on every pooled handle: corruption codes go to
/// the corruption queue, every error goes to the error listeners.
pub(crate) fn error_router(core: Weak<Core>) -> tidesql_sqlite::ErrorObserver {
    Arc::new(move |ctx: TraceContext<'_>, error: &Error| {
        let Some(core) = core.upgrade() else { return };
        if error.is_corruption() {
            core.report_corruption(ctx.path);
        }
        let listeners = core.notifier().error();
        if !listeners.is_empty() {
            listeners.dispatch(&ErrorEvent::from_handle(ctx, error));
        }
    })
}
