//! Timed background work keyed by database path.
//!
//! Each [`WorkQueue`] owns one named worker thread. A key is pending at most
//! once; a unit of work runs when its due time passes and may ask to be run
//! again after a delay. Because one thread serves the whole queue, at most
//! one unit per key is ever in flight.

pub(crate) mod backup;
pub(crate) mod checkpoint;
pub(crate) mod corruption;
pub(crate) mod migration;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tidesql_core::{Error, Result};

/// Timing of one maintenance queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Delay between a unit being requested and running.
    pub delay: Duration,
    /// Delay before retrying a unit that hit lock contention.
    pub retry_delay: Duration,
}

impl QueueConfig {
    pub fn new(delay: Duration, retry_delay: Duration) -> Self {
        Self { delay, retry_delay }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Runs one unit for a key; `Some(delay)` schedules it again.
pub(crate) type Handler = Arc<dyn Fn(&str) -> Option<Duration> + Send + Sync>;

#[derive(Default)]
struct State {
    pending: HashMap<String, Instant>,
    running: Option<String>,
    stopped: bool,
    runs: u64,
}

struct Shared {
    name: &'static str,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkQueue {
    shared: Arc<Shared>,
    handler: Handler,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub(crate) fn new(name: &'static str, handler: Handler) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
            }),
            handler,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Start the worker thread. Does nothing if it is already running.
    pub fn run(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }
        self.shared.lock().stopped = false;
        let shared = Arc::clone(&self.shared);
        let handler = Arc::clone(&self.handler);
        let spawned = std::thread::Builder::new()
            .name(format!("tidesql-{}", self.shared.name))
            .spawn(move || worker_loop(&shared, &handler))
            .map_err(Error::Io)?;
        *worker = Some(spawned);
        Ok(())
    }

    /// Stop the worker after its current unit. Pending keys are kept and run
    /// once the queue is started again.
    pub fn stop(&self) {
        self.shared.lock().stopped = true;
        self.shared.changed.notify_all();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            // The last owner of a queue may be one of its own units.
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                tracing::warn!(queue = self.shared.name, "queue worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Schedule `key` to run after `delay`, or sooner if it is already due
    /// earlier.
    pub fn put(&self, key: &str, delay: Duration) {
        let due = Instant::now() + delay;
        self.shared
            .lock()
            .pending
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).min(due))
            .or_insert(due);
        self.wake();
    }

    /// Schedule `key` only if it is neither pending nor running.
    pub fn offer(&self, key: &str, delay: Duration) -> bool {
        {
            let mut state = self.shared.lock();
            if state.pending.contains_key(key) || state.running.as_deref() == Some(key) {
                return false;
            }
            state.pending.insert(key.to_string(), Instant::now() + delay);
        }
        self.wake();
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.shared.lock().pending.remove(key).is_some()
    }

    /// Pending or running.
    pub fn contains(&self, key: &str) -> bool {
        let state = self.shared.lock();
        state.pending.contains_key(key) || state.running.as_deref() == Some(key)
    }

    /// Units completed since the queue was created.
    pub fn runs(&self) -> u64 {
        self.shared.lock().runs
    }

    /// Block until at least `runs` units have completed.
    pub fn wait_for_runs(&self, runs: u64, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.runs < runs)
            .unwrap_or_else(PoisonError::into_inner);
        state.runs >= runs
    }

    fn wake(&self) {
        self.shared.changed.notify_all();
        if let Err(err) = self.run() {
            tracing::warn!(queue = self.shared.name, error = %err, "failed to start queue worker");
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("runs", &state.runs)
            .finish()
    }
}

fn worker_loop(shared: &Shared, handler: &Handler) {
    tracing::info!(queue = shared.name, "queue worker started");
    let mut state = shared.lock();
    loop {
        if state.stopped {
            break;
        }
        let now = Instant::now();
        let next = state
            .pending
            .iter()
            .min_by_key(|(_, due)| **due)
            .map(|(key, due)| (key.clone(), *due));
        match next {
            Some((key, due)) if due <= now => {
                state.pending.remove(&key);
                state.running = Some(key.clone());
                drop(state);

                let reschedule = match catch_unwind(AssertUnwindSafe(|| handler(&key))) {
                    Ok(reschedule) => reschedule,
                    Err(_) => {
                        tracing::warn!(queue = shared.name, key = %key, "queue unit panicked");
                        None
                    }
                };

                state = shared.lock();
                state.running = None;
                state.runs += 1;
                if let Some(delay) = reschedule {
                    let due = Instant::now() + delay;
                    state
                        .pending
                        .entry(key)
                        .and_modify(|current| *current = (*current).min(due))
                        .or_insert(due);
                }
                shared.changed.notify_all();
            }
            Some((_, due)) => {
                state = shared
                    .changed
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
    tracing::info!(queue = shared.name, "queue worker stopped");
}
