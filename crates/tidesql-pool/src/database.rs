//! One database file: its idle handles, leases and configuration snapshot.

use crate::{Intent, PoolConfig, PoolStats};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tidesql_core::error::{ConnectionError, ConnectionErrorKind};
use tidesql_core::{Error, Recyclable, Result};
use tidesql_sqlite::{Configs, ErrorObserver, Handle, HandleConfig};

/// A pooled handle. Dropping the last clone returns the handle to its
/// database (or closes it).
pub type RecyclableHandle = Recyclable<Handle>;

struct Pooled {
    handle: Handle,
    /// Configuration the handle was last brought up to.
    applied: Arc<Configs>,
}

#[derive(Default)]
struct LeaseState {
    idle: Vec<Pooled>,
    leased: usize,
    readers: usize,
    writers: usize,
    exclusive: bool,
    exclusive_waiting: usize,
    closing: bool,
}

impl LeaseState {
    fn admits(&self, intent: Intent) -> bool {
        match intent {
            Intent::Read => true,
            Intent::Write => !self.exclusive && self.exclusive_waiting == 0,
            Intent::Exclusive => !self.exclusive && self.writers == 0,
        }
    }

    fn take(&mut self, intent: Intent) {
        self.leased += 1;
        match intent {
            Intent::Read => self.readers += 1,
            Intent::Write => self.writers += 1,
            Intent::Exclusive => self.exclusive = true,
        }
    }

    fn give(&mut self, intent: Intent) {
        self.leased -= 1;
        match intent {
            Intent::Read => self.readers -= 1,
            Intent::Write => self.writers -= 1,
            Intent::Exclusive => self.exclusive = false,
        }
    }
}

/// State shared with every outstanding lease.
struct Shared {
    path: String,
    max_idle: usize,
    state: Mutex<LeaseState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a>(
        &self,
        mut state: MutexGuard<'a, LeaseState>,
        deadline: Instant,
        mut ready: impl FnMut(&LeaseState) -> bool,
    ) -> std::result::Result<MutexGuard<'a, LeaseState>, MutexGuard<'a, LeaseState>> {
        loop {
            if ready(&state) {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(state);
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release_lease(&self, intent: Intent) {
        self.lock().give(intent);
        self.changed.notify_all();
    }

    fn give_back(&self, pooled: Pooled, intent: Intent) {
        let Pooled { handle, applied } = pooled;
        handle.detach_cancellation_signal();
        handle.set_tag(None);
        if handle.is_open() && handle.is_in_transaction() {
            tracing::warn!(path = %self.path, handle = handle.id(), "handle returned inside a transaction, rolling back");
            if handle.rollback_transaction().is_err() {
                handle.invalidate();
            }
        }

        let mut state = self.lock();
        state.give(intent);
        let keep = !state.closing && handle.is_open() && state.idle.len() < self.max_idle;
        let discarded = if keep {
            state.idle.push(Pooled { handle, applied });
            None
        } else {
            Some(handle)
        };
        drop(state);
        self.changed.notify_all();

        if let Some(handle) = discarded {
            tracing::trace!(path = %self.path, handle = handle.id(), "closing released handle");
            handle.invalidate();
        }
    }
}

/// A database file shared by every caller that opens the same path.
pub struct InnerDatabase {
    shared: Arc<Shared>,
    config: PoolConfig,
    configs: RwLock<Arc<Configs>>,
    error_observer: RwLock<Option<ErrorObserver>>,
}

impl InnerDatabase {
    pub fn new(path: impl Into<String>, configs: Configs, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                max_idle: config.max_idle,
                state: Mutex::new(LeaseState::default()),
                changed: Condvar::new(),
            }),
            config,
            configs: RwLock::new(Arc::new(configs)),
            error_observer: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current configuration snapshot.
    pub fn configs(&self) -> Arc<Configs> {
        Arc::clone(&self.configs.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the configuration. Idle handles are brought up to date when
    /// next acquired; handles opened from now on run the whole pipeline.
    pub fn set_configs(&self, configs: Configs) {
        *self.configs.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(configs);
    }

    /// Apply `f` to the configuration snapshot atomically.
    pub fn update_configs(&self, f: impl FnOnce(&Configs) -> Configs) {
        let mut guard = self.configs.write().unwrap_or_else(PoisonError::into_inner);
        let next = f(&guard);
        *guard = Arc::new(next);
    }

    /// Observer installed on every handle opened from now on. Idle handles
    /// are purged so the change reaches every future lease.
    pub fn set_error_observer(&self, observer: Option<ErrorObserver>) {
        *self
            .error_observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = observer;
        self.purge();
    }

    /// Lease a handle.
    ///
    /// `Read` never waits. `Write` waits while an exclusive lease is held or
    /// requested; `Exclusive` waits until no write or exclusive lease is held.
    pub fn acquire(&self, intent: Intent) -> Result<RecyclableHandle> {
        let deadline = Instant::now() + self.config.acquire_wait();
        let mut state = self.shared.lock();
        if state.closing {
            return Err(self.closed_error());
        }
        if intent == Intent::Exclusive {
            state.exclusive_waiting += 1;
        }
        let waited = self
            .shared
            .wait_until(state, deadline, |s| s.closing || s.admits(intent));
        let mut state = match waited {
            Ok(state) => state,
            Err(mut state) => {
                if intent == Intent::Exclusive {
                    state.exclusive_waiting -= 1;
                }
                drop(state);
                self.shared.changed.notify_all();
                return Err(Error::pool_timeout(format!(
                    "no {:?} lease on '{}' within {}ms",
                    intent, self.shared.path, self.config.acquire_timeout_ms
                )));
            }
        };
        if intent == Intent::Exclusive {
            state.exclusive_waiting -= 1;
        }
        if state.closing {
            drop(state);
            self.shared.changed.notify_all();
            return Err(self.closed_error());
        }
        state.take(intent);
        let idle = state.idle.pop();
        drop(state);

        let pooled = match self.prepare_handle(idle) {
            Ok(pooled) => pooled,
            Err(err) => {
                self.shared.release_lease(intent);
                return Err(err);
            }
        };
        tracing::trace!(path = %self.shared.path, handle = pooled.handle.id(), ?intent, "leased handle");

        let shared = Arc::clone(&self.shared);
        let applied = pooled.applied;
        Ok(Recyclable::new(pooled.handle, move |handle| {
            shared.give_back(Pooled { handle, applied }, intent);
        }))
    }

    /// Reuse an idle handle (reconfiguring it if the snapshot moved on) or
    /// open a new one.
    fn prepare_handle(&self, idle: Option<Pooled>) -> Result<Pooled> {
        let current = self.configs();
        if let Some(pooled) = idle {
            if Arc::ptr_eq(&pooled.applied, &current) {
                return Ok(pooled);
            }
            match current.reconfigure(&pooled.applied, &pooled.handle) {
                Ok(()) => {
                    return Ok(Pooled {
                        handle: pooled.handle,
                        applied: current,
                    });
                }
                Err(err) => {
                    tracing::debug!(path = %self.shared.path, error = %err, "reconfigure failed, reopening");
                    pooled.handle.invalidate();
                }
            }
        }
        let handle = self.open_handle(&current)?;
        Ok(Pooled {
            handle,
            applied: current,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(path = %self.shared.path))]
    fn open_handle(&self, configs: &Configs) -> Result<Handle> {
        let handle = Handle::new(
            HandleConfig::file(self.shared.path.clone()).busy_timeout(self.config.busy_timeout_ms),
        );
        let observer = self
            .error_observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handle.set_error_observer(observer);
        if let Err(err) = handle.open() {
            handle.invalidate();
            return Err(err);
        }
        configs.invoke(&handle)?;
        tracing::debug!(handle = handle.id(), configs = configs.len(), "opened pooled handle");
        Ok(handle)
    }

    fn closed_error(&self) -> Error {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            path: self.shared.path.clone(),
            message: "database is closing".to_string(),
            source: None,
        })
    }

    /// Close every idle handle.
    pub fn purge(&self) {
        let idle = std::mem::take(&mut self.shared.lock().idle);
        let count = idle.len();
        for pooled in idle {
            pooled.handle.invalidate();
        }
        if count > 0 {
            tracing::debug!(path = %self.shared.path, count, "purged idle handles");
        }
    }

    /// Block new leases, wait for outstanding ones to come back, close every
    /// handle, then run `f` before reopening for business.
    pub fn close<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let deadline = Instant::now() + self.config.acquire_wait();
        let mut state = self.shared.lock();
        if state.closing {
            return Err(self.closed_error());
        }
        state.closing = true;
        let drained = self.shared.wait_until(state, deadline, |s| s.leased == 0);
        let mut state = match drained {
            Ok(state) => state,
            Err(mut state) => {
                state.closing = false;
                let leased = state.leased;
                drop(state);
                self.shared.changed.notify_all();
                return Err(Error::pool_timeout(format!(
                    "{} handles on '{}' still leased",
                    leased, self.shared.path
                )));
            }
        };
        let idle = std::mem::take(&mut state.idle);
        drop(state);
        for pooled in idle {
            pooled.handle.invalidate();
        }
        tracing::debug!(path = %self.shared.path, "closed database");

        let out = f();

        self.shared.lock().closing = false;
        self.shared.changed.notify_all();
        Ok(out)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.lock().closing
    }

    /// True while any handle (idle or leased) is open.
    pub fn is_opened(&self) -> bool {
        let state = self.shared.lock();
        state.leased > 0 || !state.idle.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_handles: state.leased + state.idle.len(),
            idle_handles: state.idle.len(),
            active_handles: state.leased,
            readers: state.readers,
            writers: state.writers,
            exclusive: state.exclusive,
        }
    }
}

impl Drop for InnerDatabase {
    fn drop(&mut self) {
        self.purge();
    }
}

impl std::fmt::Debug for InnerDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerDatabase")
            .field("path", &self.shared.path)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    pub(crate) fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
