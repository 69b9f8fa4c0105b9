//! Core types for TideSQL.
//!
//! This crate holds everything the engine layers share:
//!
//! - `Error` / `Result` for every fallible operation
//! - `Value` and `Row` for bound parameters and extracted results
//! - `Recyclable<T>` for pooled ownership with a release action
//! - `CancellationSignal` for cross-thread interruption
//! - `sql` scanning and the `Statement` boundary trait
//! - `RetryPolicy` for busy backoff

pub mod cancellation;
pub mod error;
pub mod identifiers;
pub mod recyclable;
pub mod retry;
pub mod row;
pub mod sql;
pub mod value;

pub use cancellation::{CancellationObserver, CancellationSignal};
pub use error::{Error, Result};
pub use identifiers::{quote_ident, quote_literal, quote_qualified, sanitize_identifier, unquote_ident};
pub use recyclable::Recyclable;
pub use retry::{RetryPolicy, retry_busy};
pub use row::{Columns, FromValue, Row};
pub use sql::{Statement, StatementInfo, StatementKind};
pub use value::Value;
