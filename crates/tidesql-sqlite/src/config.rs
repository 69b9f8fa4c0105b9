//! The per-connection configuration pipeline.
//!
//! Every newly opened handle runs the database's [`Configs`] in ascending
//! [`Priority`], ties broken by registration order. A snapshot is immutable;
//! registering or removing a config produces a new one.

use crate::handle::Handle;
use std::fmt;
use std::sync::Arc;
use tidesql_core::error::{ConfigError, ConnectionError, ConnectionErrorKind};
use tidesql_core::{Error, Result};

/// One step of connection set-up.
pub trait Config: Send + Sync {
    /// Apply to a freshly opened handle.
    fn invoke(&self, handle: &Handle) -> Result<()>;

    /// Undo on a live handle when the config is removed.
    fn uninvoke(&self, _handle: &Handle) -> Result<()> {
        Ok(())
    }
}

/// A config built from closures.
pub struct CustomConfig<I, U = fn(&Handle) -> Result<()>> {
    invoke: I,
    uninvoke: Option<U>,
}

impl<I> CustomConfig<I>
where
    I: Fn(&Handle) -> Result<()> + Send + Sync,
{
    pub fn new(invoke: I) -> Self {
        Self {
            invoke,
            uninvoke: None,
        }
    }
}

impl<I, U> CustomConfig<I, U>
where
    I: Fn(&Handle) -> Result<()> + Send + Sync,
    U: Fn(&Handle) -> Result<()> + Send + Sync,
{
    pub fn with_uninvoke(invoke: I, uninvoke: U) -> Self {
        Self {
            invoke,
            uninvoke: Some(uninvoke),
        }
    }
}

impl<I, U> Config for CustomConfig<I, U>
where
    I: Fn(&Handle) -> Result<()> + Send + Sync,
    U: Fn(&Handle) -> Result<()> + Send + Sync,
{
    fn invoke(&self, handle: &Handle) -> Result<()> {
        (self.invoke)(handle)
    }

    fn uninvoke(&self, handle: &Handle) -> Result<()> {
        match &self.uninvoke {
            Some(uninvoke) => uninvoke(handle),
            None => Ok(()),
        }
    }
}

/// Application order of a config; lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const HIGHEST: Priority = Priority(i32::MIN);
    pub const HIGHER: Priority = Priority(-100);
    pub const HIGH: Priority = Priority(-10);
    pub const DEFAULT: Priority = Priority(0);
    pub const LOW: Priority = Priority(10);
    pub const LOWER: Priority = Priority(100);
    pub const LOWEST: Priority = Priority(i32::MAX);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

#[derive(Clone)]
struct Entry {
    name: String,
    priority: Priority,
    sequence: u64,
    config: Arc<dyn Config>,
}

/// An ordered, name-unique set of configs.
#[derive(Clone, Default)]
pub struct Configs {
    entries: Vec<Entry>,
    next_sequence: u64,
}

impl Configs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `config` under `name`, replacing any previous entry with that
    /// name. The replacement takes a fresh registration sequence.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        config: Arc<dyn Config>,
        priority: Priority,
    ) -> Option<Arc<dyn Config>> {
        let name = name.into();
        let replaced = self.remove(&name);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let entry = Entry {
            name,
            priority,
            sequence,
            config,
        };
        let at = self
            .entries
            .partition_point(|e| (e.priority, e.sequence) <= (entry.priority, entry.sequence));
        self.entries.insert(at, entry);
        replaced
    }

    /// Copy-on-write form of [`insert`](Self::insert).
    pub fn with(&self, name: impl Into<String>, config: Arc<dyn Config>, priority: Priority) -> Self {
        let mut next = self.clone();
        next.insert(name, config, priority);
        next
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Config>> {
        let index = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(index).config)
    }

    /// Copy-on-write form of [`remove`](Self::remove).
    pub fn without(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.remove(name);
        next
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Config>> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names in application order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Apply every config in order. The first failure invalidates the handle
    /// and surfaces as a `Configure` connection error.
    pub fn invoke(&self, handle: &Handle) -> Result<()> {
        for entry in &self.entries {
            if let Err(err) = entry.config.invoke(handle) {
                tracing::warn!(
                    path = %handle.path(),
                    config = %entry.name,
                    error = %err,
                    "config failed, invalidating handle"
                );
                handle.invalidate();
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Configure,
                    path: handle.path().to_string(),
                    message: format!("config '{}' failed: {}", entry.name, err),
                    source: Some(Box::new(err)),
                }));
            }
        }
        Ok(())
    }

    /// Undo every config in reverse order.
    pub fn uninvoke(&self, handle: &Handle) -> Result<()> {
        for entry in self.entries.iter().rev() {
            uninvoke_entry(entry, handle)?;
        }
        Ok(())
    }

    /// Bring a handle configured with `previous` up to this snapshot:
    /// entries that disappeared (or were replaced) are uninvoked in reverse
    /// order, then new entries are invoked in order. A failing invoke
    /// invalidates the handle.
    pub fn reconfigure(&self, previous: &Configs, handle: &Handle) -> Result<()> {
        for entry in previous.entries.iter().rev() {
            if !self.has_entry(entry) {
                uninvoke_entry(entry, handle)?;
            }
        }
        let added = Configs {
            entries: self
                .entries
                .iter()
                .filter(|e| !previous.has_entry(e))
                .cloned()
                .collect(),
            next_sequence: self.next_sequence,
        };
        added.invoke(handle)
    }

    fn has_entry(&self, entry: &Entry) -> bool {
        self.entries
            .iter()
            .any(|e| e.sequence == entry.sequence && e.name == entry.name)
    }
}

fn uninvoke_entry(entry: &Entry, handle: &Handle) -> Result<()> {
    entry.config.uninvoke(handle).map_err(|err| {
        Error::Config(ConfigError {
            name: Some(entry.name.clone()),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    })
}

impl fmt::Debug for Configs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.name, e.priority.0)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Config> {
        let invoke_log = Arc::clone(log);
        let uninvoke_log = Arc::clone(log);
        Arc::new(CustomConfig::with_uninvoke(
            move |_: &Handle| {
                invoke_log.lock().unwrap().push(name.to_string());
                Ok(())
            },
            move |_: &Handle| {
                uninvoke_log.lock().unwrap().push(format!("-{}", name));
                Ok(())
            },
        ))
    }

    #[test]
    fn priority_order_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut configs = Configs::new();
        configs.insert("A", recorder(&log, "A"), Priority::LOW);
        configs.insert("B", recorder(&log, "B"), Priority::HIGHEST);
        configs.insert("C", recorder(&log, "C"), Priority::HIGHER);
        assert_eq!(configs.names().collect::<Vec<_>>(), ["B", "C", "A"]);

        let handle = Handle::open_memory().unwrap();
        configs.invoke(&handle).unwrap();
        assert_eq!(*log.lock().unwrap(), ["B", "C", "A"]);

        log.lock().unwrap().clear();
        configs.uninvoke(&handle).unwrap();
        assert_eq!(*log.lock().unwrap(), ["-A", "-C", "-B"]);
    }

    #[test]
    fn equal_priority_keeps_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let configs = Configs::new()
            .with("first", recorder(&log, "first"), Priority::DEFAULT)
            .with("second", recorder(&log, "second"), Priority::DEFAULT)
            .with("third", recorder(&log, "third"), Priority::DEFAULT);
        assert_eq!(configs.names().collect::<Vec<_>>(), ["first", "second", "third"]);
    }

    #[test]
    fn last_registration_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut configs = Configs::new();
        configs.insert("x", recorder(&log, "x1"), Priority::DEFAULT);
        configs.insert("y", recorder(&log, "y"), Priority::DEFAULT);
        let replaced = configs.insert("x", recorder(&log, "x2"), Priority::DEFAULT);
        assert!(replaced.is_some());
        assert_eq!(configs.len(), 2);
        assert_eq!(configs.names().collect::<Vec<_>>(), ["y", "x"]);

        let handle = Handle::open_memory().unwrap();
        configs.invoke(&handle).unwrap();
        assert_eq!(*log.lock().unwrap(), ["y", "x2"]);
    }

    #[test]
    fn copy_on_write_leaves_snapshot_untouched() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = Configs::new().with("a", recorder(&log, "a"), Priority::DEFAULT);
        let extended = base.with("b", recorder(&log, "b"), Priority::HIGH);
        let trimmed = extended.without("a");
        assert_eq!(base.len(), 1);
        assert_eq!(extended.names().collect::<Vec<_>>(), ["b", "a"]);
        assert_eq!(trimmed.names().collect::<Vec<_>>(), ["b"]);
    }

    #[test]
    fn reconfigure_applies_only_the_difference() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let before = Configs::new()
            .with("keep", recorder(&log, "keep"), Priority::DEFAULT)
            .with("drop", recorder(&log, "drop"), Priority::DEFAULT);
        let after = before
            .without("drop")
            .with("add", recorder(&log, "add"), Priority::HIGH);

        let handle = Handle::open_memory().unwrap();
        before.invoke(&handle).unwrap();
        log.lock().unwrap().clear();

        after.reconfigure(&before, &handle).unwrap();
        assert_eq!(*log.lock().unwrap(), ["-drop", "add"]);
    }

    #[test]
    fn failing_config_invalidates_handle() {
        let mut configs = Configs::new();
        configs.insert(
            "broken",
            Arc::new(CustomConfig::new(|h: &Handle| h.execute_raw("NOT SQL"))),
            Priority::DEFAULT,
        );
        let handle = Handle::open_memory().unwrap();
        let err = configs.invoke(&handle).unwrap_err();
        assert!(matches!(err, Error::Connection(ref e) if e.kind == ConnectionErrorKind::Configure));
        assert!(handle.is_invalidated());
    }
}
