use crate::engine::MigrationEngine;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tidesql_core::{Result, StatementInfo};
use tidesql_sqlite::{Config, Handle, Rewrite, StatementRewriter};

/// Where the migration engine of one database lives once it exists.
///
/// Handles take the slot itself as their rewriter, so an engine installed
/// or a migration registered later reaches handles that are already leased
/// on their next statement.
#[derive(Debug, Default)]
pub struct MigrationSlot {
    engine: ArcSwapOption<MigrationEngine>,
}

impl MigrationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: Arc<MigrationEngine>) -> Self {
        Self {
            engine: ArcSwapOption::from(Some(engine)),
        }
    }

    pub fn engine(&self) -> Option<Arc<MigrationEngine>> {
        self.engine.load_full()
    }

    pub fn install(&self, engine: Arc<MigrationEngine>) {
        self.engine.store(Some(engine));
    }
}

impl StatementRewriter for MigrationSlot {
    fn generation(&self) -> u64 {
        self.engine.load_full().map_or(0, |engine| engine.generation())
    }

    fn is_active(&self) -> bool {
        self.engine.load_full().is_some_and(|engine| engine.is_active())
    }

    fn rewrite(&self, sql: &str, info: &StatementInfo) -> Result<Option<Rewrite>> {
        match self.engine.load_full() {
            Some(engine) => engine.rewrite(sql, info),
            None => Ok(None),
        }
    }
}

/// Installs a [`MigrationSlot`] as the statement rewriter of every handle.
///
/// Sources in other files are attached while the handle is still outside
/// any transaction; sources registered later are attached lazily on first
/// use.
pub struct MigrationConfig {
    slot: Arc<MigrationSlot>,
}

impl MigrationConfig {
    /// Conventional pipeline name.
    pub const NAME: &'static str = "tidesql.migration";

    pub fn new(engine: Arc<MigrationEngine>) -> Self {
        Self::with_slot(Arc::new(MigrationSlot::with_engine(engine)))
    }

    pub fn with_slot(slot: Arc<MigrationSlot>) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &Arc<MigrationSlot> {
        &self.slot
    }
}

impl Config for MigrationConfig {
    fn invoke(&self, handle: &Handle) -> Result<()> {
        if let Some(engine) = self.slot.engine() {
            for info in engine.snapshot().infos() {
                if let Some(attach) = info.attach_sql() {
                    handle.ensure_prerequisite(&attach)?;
                }
            }
        }
        let rewriter: Arc<dyn StatementRewriter> = self.slot.clone();
        handle.set_rewriter(Some(rewriter));
        Ok(())
    }

    fn uninvoke(&self, handle: &Handle) -> Result<()> {
        handle.set_rewriter(None);
        Ok(())
    }
}
