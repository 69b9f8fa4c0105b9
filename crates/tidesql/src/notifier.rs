//! Process-wide event delivery.
//!
//! Listeners are registered by name; registering under an existing name
//! replaces the previous listener and passing `None` removes it. Dispatch
//! runs on a snapshot of the listener map, so a listener may register or
//! remove listeners (itself included) from inside its callback.

use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tidesql_core::Error;
use tidesql_sqlite::TraceContext;

/// Anything the notifier can deliver.
pub trait Event: Serialize {
    /// Render the event for logs or external sinks.
    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// What the corruption queue did about a damaged file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CorruptionOutcome {
    /// The database was replaced by its last backup.
    Restored { backup: PathBuf },
    /// The damaged files were moved aside; the next open starts empty.
    Quarantined { moved_to: PathBuf },
    /// Neither repair could be carried out.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptionEvent {
    pub path: String,
    /// First line reported by the integrity check.
    pub message: String,
    #[serde(flatten)]
    pub outcome: CorruptionOutcome,
}

impl Event for CorruptionEvent {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlTraceEvent {
    pub path: String,
    pub handle_id: u64,
    pub tag: Option<String>,
    pub sql: String,
}

impl Event for SqlTraceEvent {}

impl SqlTraceEvent {
    pub(crate) fn new(ctx: TraceContext<'_>, sql: &str) -> Self {
        Self {
            path: ctx.path.to_string(),
            handle_id: ctx.handle_id,
            tag: ctx.tag.map(str::to_string),
            sql: sql.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformanceEvent {
    pub path: String,
    pub handle_id: u64,
    pub tag: Option<String>,
    pub sql: String,
    pub elapsed_us: u64,
}

impl Event for PerformanceEvent {}

/// An error reported by a handle or a background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub path: String,
    pub handle_id: Option<u64>,
    pub tag: Option<String>,
    /// Primary engine result code, when the engine produced the error.
    pub code: Option<i32>,
    pub message: String,
    pub sql: Option<String>,
    /// Which background task failed; `None` for foreground handle errors.
    pub origin: Option<&'static str>,
}

impl Event for ErrorEvent {}

impl ErrorEvent {
    pub(crate) fn from_handle(ctx: TraceContext<'_>, error: &Error) -> Self {
        Self {
            path: ctx.path.to_string(),
            handle_id: Some(ctx.handle_id),
            tag: ctx.tag.map(str::to_string),
            code: error.code(),
            message: error.to_string(),
            sql: error.sql().map(str::to_string),
            origin: None,
        }
    }

    pub(crate) fn background(path: &str, origin: &'static str, error: &Error) -> Self {
        Self {
            path: path.to_string(),
            handle_id: None,
            tag: None,
            code: error.code(),
            message: error.to_string(),
            sql: error.sql().map(str::to_string),
            origin: Some(origin),
        }
    }
}

/// A batch moved by the background migration queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationEvent {
    pub path: String,
    pub table: String,
    pub rows: u64,
    /// The table finished migrating with this batch.
    pub done: bool,
}

impl Event for MigrationEvent {}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Named listeners for one event type.
pub struct Listeners<E> {
    map: RwLock<BTreeMap<String, Listener<E>>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<E: Event> Listeners<E> {
    /// Register (`Some`) or remove (`None`) the listener called `name`.
    pub fn set(&self, name: impl Into<String>, listener: Option<Listener<E>>) {
        let name = name.into();
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        match listener {
            Some(listener) => {
                map.insert(name, listener);
            }
            None => {
                map.remove(&name);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every listener. A panicking listener is logged and
    /// does not stop delivery to the others.
    pub fn dispatch(&self, event: &E) {
        let listeners: Vec<(String, Listener<E>)> = self
            .map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, listener)| (name.clone(), Arc::clone(listener)))
            .collect();
        for (name, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(listener = %name, event = %event.to_json(), "listener panicked");
            }
        }
    }
}

/// Every listener map the library delivers to.
#[derive(Default)]
pub struct Notifier {
    corruption: Listeners<CorruptionEvent>,
    sql_trace: Listeners<SqlTraceEvent>,
    performance: Listeners<PerformanceEvent>,
    error: Listeners<ErrorEvent>,
    migration: Listeners<MigrationEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn corruption(&self) -> &Listeners<CorruptionEvent> {
        &self.corruption
    }

    pub fn sql_trace(&self) -> &Listeners<SqlTraceEvent> {
        &self.sql_trace
    }

    pub fn performance(&self) -> &Listeners<PerformanceEvent> {
        &self.performance
    }

    pub fn error(&self) -> &Listeners<ErrorEvent> {
        &self.error
    }

    pub fn migration(&self) -> &Listeners<MigrationEvent> {
        &self.migration
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("corruption", &self.corruption.len())
            .field("sql_trace", &self.sql_trace.len())
            .field("performance", &self.performance.len())
            .field("error", &self.error.len())
            .field("migration", &self.migration.len())
            .finish()
    }
}
