//! The set of migrations statements are currently rewritten against.
//!
//! Readers load an immutable [`MappingSnapshot`] without locking; the engine
//! publishes a new snapshot (with a higher generation) whenever a migration
//! is registered or finishes.
//!
//! A finished migration from a table in the same file leaves a rename behind:
//! the source name keeps meaning the target table for as long as the set
//! lives, so callers that still use the old name never see the emptied
//! source.

use crate::info::MigrationInfo;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};
use tidesql_core::Result;
use tidesql_core::error::{Error, MigrationError, MigrationErrorKind};

/// How a table name written in a statement is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// The name is (or renames to) a migrating table.
    Migrating(&'a Arc<MigrationInfo>),
    /// The name belongs to a finished migration; it now means `main.<table>`.
    Renamed(&'a str),
}

/// One published state of the mapping set.
#[derive(Debug, Clone, Default)]
pub struct MappingSnapshot {
    generation: u64,
    infos: Vec<Arc<MigrationInfo>>,
    /// Finished same-file migrations, oldest first.
    renames: Vec<Arc<MigrationInfo>>,
}

impl MappingSnapshot {
    pub fn new(infos: Vec<Arc<MigrationInfo>>) -> Self {
        Self {
            generation: 1,
            infos,
            renames: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// No migration is active. Renames may remain.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// No statement can be affected: nothing migrates and nothing was renamed.
    pub fn is_inert(&self) -> bool {
        self.infos.is_empty() && self.renames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn infos(&self) -> &[Arc<MigrationInfo>] {
        &self.infos
    }

    /// The migration whose logical name `name` is.
    pub fn lookup(&self, name: &str) -> Option<&Arc<MigrationInfo>> {
        self.infos.iter().find(|info| info.is_logical_name(name))
    }

    /// The migration into `table`.
    pub fn get(&self, table: &str) -> Option<&Arc<MigrationInfo>> {
        self.infos
            .iter()
            .find(|info| info.table().eq_ignore_ascii_case(table))
    }

    /// The finished migration whose source was called `name`.
    fn renamed(&self, name: &str) -> Option<&Arc<MigrationInfo>> {
        self.renames
            .iter()
            .rev()
            .find(|info| info.source_table().eq_ignore_ascii_case(name))
    }

    /// Follow renames from `name` until it reaches a migrating table or a
    /// name nothing renames further.
    pub fn resolve(&self, name: &str) -> Option<Resolution<'_>> {
        if let Some(info) = self.lookup(name) {
            return Some(Resolution::Migrating(info));
        }
        let mut table = self.renamed(name)?.table();
        // Registration refuses renamed names, so chains end; the bound only
        // guards against a hand-built snapshot.
        for _ in 0..self.renames.len() {
            if let Some(info) = self.lookup(table) {
                return Some(Resolution::Migrating(info));
            }
            match self.renamed(table) {
                Some(next) => table = next.table(),
                None => break,
            }
        }
        Some(Resolution::Renamed(table))
    }

    fn successor(&self, infos: Vec<Arc<MigrationInfo>>, renames: Vec<Arc<MigrationInfo>>) -> Self {
        Self {
            generation: self.generation + 1,
            infos,
            renames,
        }
    }
}

/// Copy-on-write holder of the current snapshot.
#[derive(Debug)]
pub struct MappingSet {
    current: ArcSwap<MappingSnapshot>,
    /// Serializes publishers; readers never take it.
    publish: Mutex<()>,
}

impl Default for MappingSet {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(MappingSnapshot::new(Vec::new())),
            publish: Mutex::new(()),
        }
    }
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<MappingSnapshot> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn is_inert(&self) -> bool {
        self.current.load().is_inert()
    }

    /// Publish a snapshot including `info`. Fails if any logical name of
    /// `info` already belongs to an active migration, or names the source of
    /// a finished one.
    pub fn insert(&self, info: Arc<MigrationInfo>) -> Result<Arc<MappingSnapshot>> {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();
        let clash = current.infos.iter().find(|existing| {
            existing.is_logical_name(info.table())
                || info.is_logical_name(existing.table())
                || (!info.base().is_cross_database() && existing.is_logical_name(info.source_table()))
        });
        if let Some(existing) = clash {
            return Err(already_registered(
                &info,
                format!("overlaps the migration into '{}'", existing.table()),
            ));
        }
        let names = std::iter::once(info.table())
            .chain((!info.base().is_cross_database()).then_some(info.source_table()));
        for name in names {
            if let Some(renamed) = current.renamed(name) {
                return Err(already_registered(
                    &info,
                    format!("'{name}' now names '{}'", renamed.table()),
                ));
            }
        }
        let mut infos = current.infos.clone();
        infos.push(info);
        let next = Arc::new(current.successor(infos, current.renames.clone()));
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    /// Publish a snapshot without the migration into `table`. A same-file
    /// source name is kept as a rename of `table`.
    pub fn remove(&self, table: &str) -> Option<Arc<MigrationInfo>> {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current.load_full();
        let removed = Arc::clone(current.get(table)?);
        let infos = current
            .infos
            .iter()
            .filter(|info| !Arc::ptr_eq(info, &removed))
            .cloned()
            .collect();
        let mut renames = current.renames.clone();
        if !removed.base().is_cross_database() {
            renames.push(Arc::clone(&removed));
        }
        self.current.store(Arc::new(current.successor(infos, renames)));
        Some(removed)
    }
}

fn already_registered(info: &MigrationInfo, message: String) -> Error {
    Error::Migration(MigrationError {
        kind: MigrationErrorKind::AlreadyRegistered,
        table: info.table().to_string(),
        message,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::MigrationBaseInfo;

    fn info(table: &str, source: &str) -> Arc<MigrationInfo> {
        Arc::new(MigrationInfo::new(
            MigrationBaseInfo::new(table, source),
            vec!["x".into()],
            false,
        ))
    }

    #[test]
    fn generations_only_grow() {
        let set = MappingSet::new();
        let g0 = set.generation();
        set.insert(info("a", "old_a")).unwrap();
        let g1 = set.generation();
        set.insert(info("b", "old_b")).unwrap();
        assert!(set.remove("a").is_some());
        let g3 = set.generation();
        assert!(g0 < g1 && g1 < g3);
        assert!(set.remove("a").is_none());
        assert_eq!(set.generation(), g3);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let set = MappingSet::new();
        set.insert(info("a", "old_a")).unwrap();
        let before = set.load();
        set.remove("a");
        assert_eq!(before.len(), 1);
        assert!(set.load().is_empty());
        assert!(!set.load().is_inert());
    }

    #[test]
    fn finished_sources_rename_to_their_target() {
        let set = MappingSet::new();
        set.insert(info("a", "old_a")).unwrap();
        set.remove("a");
        let snap = set.load();
        assert_eq!(snap.resolve("OLD_A"), Some(Resolution::Renamed("a")));
        assert_eq!(snap.resolve("a"), None);

        // The name now taken by the rename cannot be migrated again.
        assert!(set.insert(info("old_a", "x")).is_err());
        assert!(set.insert(info("y", "old_a")).is_err());

        // A later migration out of the target is reached through the rename.
        set.insert(info("b", "a")).unwrap();
        let snap = set.load();
        match snap.resolve("old_a") {
            Some(Resolution::Migrating(info)) => assert_eq!(info.table(), "b"),
            other => panic!("unexpected: {other:?}"),
        }
        set.remove("b");
        assert_eq!(set.load().resolve("old_a"), Some(Resolution::Renamed("b")));
    }

    #[test]
    fn other_files_leave_no_rename() {
        let set = MappingSet::new();
        let base = MigrationBaseInfo::new("n", "n").from_database("/tmp/other.db");
        set.insert(Arc::new(MigrationInfo::new(base, vec!["x".into()], false))).unwrap();
        set.remove("n");
        assert!(set.load().is_inert());
    }

    #[test]
    fn overlapping_names_are_rejected() {
        let set = MappingSet::new();
        set.insert(info("a", "old_a")).unwrap();
        assert!(set.insert(info("A", "other")).is_err());
        assert!(set.insert(info("b", "a")).is_err());
        assert!(set.insert(info("old_a", "c")).is_err());
        assert!(set.insert(info("b", "old_b")).is_ok());
        assert!(set.load().lookup("OLD_B").is_some());
    }
}
