//! The registry every [`Database`] hangs off.
//!
//! A process normally uses the lazily-built [`Core::shared`] instance. Tests
//! and embedders that need isolation build their own with [`Core::new`];
//! databases opened through different cores never share handles, configs or
//! queues.

use crate::configs::{BasicConfig, CheckpointConfig, TraceConfig, error_router};
use crate::database::{Database, DatabaseState};
use crate::notifier::Notifier;
use crate::queue::{self, QueueConfig, WorkQueue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tidesql_pool::{DatabasePool, PoolConfig, normalize_path};
use tidesql_sqlite::{Config, Configs, Priority};

/// Process-wide instance, built on first use.
static SHARED: OnceLock<Arc<Core>> = OnceLock::new();

/// Settings for a [`Core`] and the databases it opens.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub pool: PoolConfig,
    /// `delay` runs after the first WAL commit of a quiet period.
    pub checkpoint: QueueConfig,
    /// WAL size (in frames) past which checkpoints truncate the log.
    pub checkpoint_truncate_frames: u32,
    /// `delay` is the interval between backups.
    pub backup: QueueConfig,
    pub corruption: QueueConfig,
    /// `delay` is the pause between background batches.
    pub migration: QueueConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            checkpoint: QueueConfig::new(Duration::from_secs(2), Duration::from_secs(1)),
            checkpoint_truncate_frames: 10_000,
            backup: QueueConfig::new(Duration::from_secs(600), Duration::from_secs(5)),
            corruption: QueueConfig::new(Duration::ZERO, Duration::from_secs(1)),
            migration: QueueConfig::new(Duration::from_millis(10), Duration::from_secs(1)),
        }
    }
}

impl CoreConfig {
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn checkpoint(mut self, queue: QueueConfig, truncate_frames: u32) -> Self {
        self.checkpoint = queue;
        self.checkpoint_truncate_frames = truncate_frames;
        self
    }

    pub fn backup(mut self, queue: QueueConfig) -> Self {
        self.backup = queue;
        self
    }

    pub fn corruption(mut self, queue: QueueConfig) -> Self {
        self.corruption = queue;
        self
    }

    pub fn migration(mut self, queue: QueueConfig) -> Self {
        self.migration = queue;
        self
    }
}

pub struct Core {
    config: CoreConfig,
    pool: DatabasePool,
    notifier: Notifier,
    default_configs: RwLock<Configs>,
    modules: RwLock<HashMap<String, Arc<dyn Config>>>,
    states: Mutex<HashMap<String, Weak<DatabaseState>>>,
    wal_frames: Mutex<HashMap<String, u32>>,
    checkpoint_queue: WorkQueue,
    backup_queue: WorkQueue,
    corruption_queue: WorkQueue,
    migration_queue: WorkQueue,
}

impl Core {
    /// The process-wide core.
    pub fn shared() -> Arc<Core> {
        Arc::clone(SHARED.get_or_init(|| Core::new(CoreConfig::default())))
    }

    /// Build the process-wide core with `config`. Returns `false` (and
    /// changes nothing) if it already exists.
    pub fn init_shared(config: CoreConfig) -> bool {
        let mut built = false;
        SHARED.get_or_init(|| {
            built = true;
            Core::new(config)
        });
        built
    }

    /// A private core, independent of [`Core::shared`].
    pub fn new(config: CoreConfig) -> Arc<Core> {
        Arc::new_cyclic(|weak: &Weak<Core>| {
            let mut defaults = Configs::new();
            defaults.insert(
                TraceConfig::NAME,
                Arc::new(TraceConfig::from_weak(weak.clone())),
                Priority::HIGHEST,
            );
            defaults.insert(BasicConfig::NAME, Arc::new(BasicConfig), Priority::HIGHER);
            defaults.insert(
                CheckpointConfig::NAME,
                Arc::new(CheckpointConfig::from_weak(weak.clone())),
                Priority::LOW,
            );
            Core {
                pool: DatabasePool::new(config.pool.clone()),
                notifier: Notifier::new(),
                default_configs: RwLock::new(defaults),
                modules: RwLock::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                wal_frames: Mutex::new(HashMap::new()),
                checkpoint_queue: worker(weak, queue::checkpoint::NAME, |core, path| {
                    queue::checkpoint::run(core, path)
                }),
                backup_queue: worker(weak, queue::backup::NAME, |core, path| {
                    queue::backup::run(core, path)
                }),
                corruption_queue: worker(weak, queue::corruption::NAME, |core, path| {
                    queue::corruption::run(core, path)
                }),
                migration_queue: worker(weak, queue::migration::NAME, queue::migration::run),
                config,
            }
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn checkpoint_queue(&self) -> &WorkQueue {
        &self.checkpoint_queue
    }

    pub fn backup_queue(&self) -> &WorkQueue {
        &self.backup_queue
    }

    pub fn corruption_queue(&self) -> &WorkQueue {
        &self.corruption_queue
    }

    pub fn migration_queue(&self) -> &WorkQueue {
        &self.migration_queue
    }

    /// The database at `path`, shared with every other caller of this core
    /// that opened the same file.
    pub fn database(self: &Arc<Self>, path: &str) -> Database {
        let key = normalize_path(path);
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get(&key).and_then(Weak::upgrade) {
            return Database::from_state(Arc::clone(self), state);
        }
        states.retain(|_, state| state.strong_count() > 0);
        let inner = self.pool.get_or_create(&key, || self.default_configs());
        inner.set_error_observer(Some(error_router(Arc::downgrade(self))));
        let key = inner.path().to_string();
        let state = Arc::new(DatabaseState::new(inner));
        tracing::debug!(path = %key, "database registered");
        states.insert(key, Arc::downgrade(&state));
        Database::from_state(Arc::clone(self), state)
    }

    /// Live state of an already-open database. Never creates one, so
    /// background work cannot keep a database alive.
    pub(crate) fn state(&self, path: &str) -> Option<Arc<DatabaseState>> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .and_then(Weak::upgrade)
    }

    fn live_states(&self) -> Vec<Arc<DatabaseState>> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Snapshot of the configs new databases start from.
    pub fn default_configs(&self) -> Configs {
        self.default_configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a config for every database of this core, including the
    /// ones already open.
    pub fn set_default_config(&self, name: &str, config: Arc<dyn Config>, priority: Priority) {
        self.default_configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::clone(&config), priority);
        for state in self.live_states() {
            state
                .inner
                .update_configs(|configs| configs.with(name, Arc::clone(&config), priority));
        }
    }

    pub fn remove_default_config(&self, name: &str) {
        self.default_configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        for state in self.live_states() {
            state.inner.update_configs(|configs| configs.without(name));
        }
    }

    /// Make `module` available to [`ModuleConfig`](crate::ModuleConfig)
    /// under `name`.
    pub fn register_module(&self, name: impl Into<String>, module: Arc<dyn Config>) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), module);
    }

    pub fn module(&self, name: &str) -> Option<Arc<dyn Config>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Close idle handles of every database.
    pub fn purge(&self) {
        self.pool.purge();
    }

    pub(crate) fn note_wal_commit(&self, path: &str, frames: u32) {
        self.restore_wal_frames(path, frames);
        self.checkpoint_queue.put(path, self.config.checkpoint.delay);
    }

    /// Record the WAL size without scheduling a checkpoint.
    pub(crate) fn restore_wal_frames(&self, path: &str, frames: u32) {
        let mut wal = self.wal_frames.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = wal.entry(path.to_string()).or_insert(0);
        *entry = (*entry).max(frames);
    }

    pub(crate) fn take_wal_frames(&self, path: &str) -> u32 {
        self.wal_frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .unwrap_or(0)
    }

    /// Schedule an integrity check unless one is already pending or running.
    pub(crate) fn report_corruption(&self, path: &str) {
        if self
            .corruption_queue
            .offer(path, self.config.corruption.delay)
        {
            tracing::warn!(path, "corruption reported, integrity check scheduled");
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.checkpoint_queue.stop();
        self.backup_queue.stop();
        self.corruption_queue.stop();
        self.migration_queue.stop();
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("config", &self.config)
            .field("default_configs", &self.default_configs())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

fn worker(
    core: &Weak<Core>,
    name: &'static str,
    run: fn(&Arc<Core>, &str) -> Option<Duration>,
) -> WorkQueue {
    let core = core.clone();
    WorkQueue::new(
        name,
        Arc::new(move |path: &str| core.upgrade().and_then(|core| run(&core, path))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesql_sqlite::CustomConfig;

    #[test]
    fn builtin_configs_run_in_priority_order() {
        let core = Core::new(CoreConfig::default());
        let names: Vec<String> = core.default_configs().names().map(str::to_string).collect();
        assert_eq!(
            names,
            vec![TraceConfig::NAME, BasicConfig::NAME, CheckpointConfig::NAME]
        );
    }

    #[test]
    fn same_path_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let core = Core::new(CoreConfig::default());
        let a = core.database(&path.to_string_lossy());
        let b = core.database(&path.to_string_lossy());
        assert_eq!(a.path(), b.path());
        assert!(core.state(a.path()).is_some());
        let key = a.path().to_string();
        drop(a);
        drop(b);
        assert!(core.state(&key).is_none());
    }

    #[test]
    fn default_configs_reach_open_databases() {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::new(CoreConfig::default());
        let db = core.database(&dir.path().join("d.db").to_string_lossy());
        db.execute("CREATE TABLE t (v)").unwrap();
        core.set_default_config(
            "app.marker",
            Arc::new(CustomConfig::new(|handle: &tidesql_sqlite::Handle| {
                handle.execute_raw("PRAGMA user_version = 7")
            })),
            Priority::DEFAULT,
        );
        let version = db.query_value("PRAGMA user_version", &[]).unwrap();
        assert_eq!(version.and_then(|v| v.as_i64()), Some(7));
        core.remove_default_config("app.marker");
        assert!(!core.default_configs().contains("app.marker"));
    }
}
