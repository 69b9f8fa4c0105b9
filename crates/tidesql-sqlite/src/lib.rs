//! SQLite handles for TideSQL.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate wraps libsqlite3 (bundled through `libsqlite3-sys`) in a
//! [`Handle`]: one native connection with a statement cache, engine hooks,
//! cooperative cancellation and transaction helpers.
//!
//! # Features
//!
//! - Statement cache keyed by SQL text, discarded when the rewriter changes
//! - [`StatementRewriter`] seam for transparent statement expansion
//! - Ordered [`Configs`] pipeline applied to every new handle
//! - Trace, profile and WAL commit hooks
//! - Cross-thread cancellation via `CancellationSignal`
//!
//! # Example
//!
//! ```rust,ignore
//! use tidesql_sqlite::Handle;
//! use tidesql_core::Value;
//!
//! let handle = Handle::open_memory()?;
//! handle.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! handle.execute_with("INSERT INTO users (name) VALUES (?)", &[Value::from("Alice")])?;
//!
//! let mut stmt = handle.prepare("SELECT name FROM users")?;
//! while stmt.step()? {
//!     println!("{}", stmt.column_text(0).unwrap_or_default());
//! }
//! ```
//!
//! # Thread Safety
//!
//! `Handle` is `Send` and `Sync`; the native connection sits behind a mutex.
//! A `PreparedStatement` borrows its handle and takes that mutex per step.

pub mod config;
pub mod ffi;
pub mod handle;
pub mod hooks;
pub mod statement;
pub mod types;

pub use config::{Config, Configs, CustomConfig, Priority};
pub use handle::{
    CheckpointMode, CheckpointResult, ErrorInfo, Handle, HandleConfig, HandleState, OpenFlags,
};
pub use hooks::{ErrorObserver, PerformanceHook, SqlTraceHook, TraceContext, WalCommitHook};
pub use statement::{
    HandleStatement, PreparedStatement, Rewrite, RewriteStep, StatementRewriter, StepRole,
};
pub use types::ColumnType;

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Re-export the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
