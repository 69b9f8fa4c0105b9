//! TideSQL - a pooled, migrating, self-maintaining SQLite access layer.
//!
//! TideSQL sits between an application and SQLite and provides:
//!
//! - A handle pool per database file with read/write/exclusive leases
//! - A per-connection configuration pipeline ordered by priority
//! - Online table migration: rows move in small batches while statements
//!   keep working against the target table
//! - Background maintenance: WAL checkpoints, periodic backups, and
//!   detection and repair of corrupted files
//! - Named listeners for SQL traces, timings, errors and corruption
//!
//! # Quick Start
//!
//! ```ignore
//! use tidesql::prelude::*;
//!
//! let db = Database::new("app.db");
//! db.execute("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! db.execute_with("INSERT INTO users (name) VALUES (?1)", &[Value::from("ada")])?;
//!
//! // Move rows out of a legacy table without downtime.
//! db.add_migration(MigrationBaseInfo::new("users", "legacy_users"))?;
//! db.enable_auto_migration(true);
//!
//! // Reads see legacy and migrated rows alike, each exactly once.
//! let everyone = db.query("SELECT name FROM users", &[])?;
//! ```

mod configs;
mod registry;
mod database;
pub mod notifier;
pub mod queue;

pub use crate::configs::{BackupConfig, BasicConfig, CheckpointConfig, ModuleConfig, TraceConfig};
pub use crate::registry::{Core, CoreConfig};
pub use crate::database::Database;
pub use notifier::{
    CorruptionEvent, CorruptionOutcome, ErrorEvent, Event, Listener, Listeners, MigrationEvent,
    Notifier, PerformanceEvent, SqlTraceEvent,
};
pub use queue::backup::backup_path;
pub use queue::{QueueConfig, WorkQueue};

// Re-export the layers underneath
pub use tidesql_core::{
    CancellationObserver, CancellationSignal, Error, Result, RetryPolicy, Row, Statement,
    StatementInfo, StatementKind, Value, error,
};
pub use tidesql_migration::{
    MigrationBaseInfo, MigrationConfig, MigrationEngine, MigrationInfo, MigrationProgress,
    MigrationSettings, MigrationSlot, MigrationState, StepReport,
};
pub use tidesql_pool::{InnerDatabase, Intent, PoolConfig, PoolStats, RecyclableHandle};
pub use tidesql_sqlite::{
    CheckpointMode, CheckpointResult, Config, Configs, CustomConfig, Handle, HandleConfig,
    OpenFlags, Priority,
};

pub mod prelude {
    pub use crate::{
        CancellationSignal,
        CheckpointMode,
        Config,
        Core,
        CustomConfig,
        Database,
        Error,
        Handle,
        Intent,
        MigrationBaseInfo,
        MigrationSettings,
        Priority,
        Result,
        Row,
        Value,
    };
}
