//! Online table migration for TideSQL.
//!
//! Rows move from a source table (in the same file or an attached one) into
//! a target table in small batches, while application statements keep using
//! the target's name as if the move had already happened:
//!
//! - reads see the union of unmigrated and migrated rows, each exactly once
//! - writes land in the target and are mirrored or reconciled against the
//!   source inside one savepoint
//! - batches run in their own write transactions, so every commit leaves
//!   each row in exactly one place
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidesql_migration::{MigrationBaseInfo, MigrationConfig, MigrationEngine, MigrationSettings};
//! use tidesql_sqlite::Config;
//!
//! let engine = Arc::new(MigrationEngine::new(MigrationSettings::default()));
//! engine.register(&handle, MigrationBaseInfo::new("users", "legacy_users"))?;
//! MigrationConfig::new(engine.clone()).invoke(&handle)?;
//!
//! // Reads and writes of `users` are rewritten until the engine is done.
//! while let Some(report) = engine.step(&handle)? {
//!     if report.done { break; }
//! }
//! ```

mod config;
mod engine;
pub mod info;
pub mod mapping;
pub mod rewrite;

pub use config::{MigrationConfig, MigrationSlot};
pub use engine::{MigrationEngine, MigrationSettings, StepReport};
pub use info::{MigrationBaseInfo, MigrationInfo, MigrationProgress, MigrationState};
pub use mapping::{MappingSet, MappingSnapshot, Resolution};
