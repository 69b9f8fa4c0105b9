//! Engine callbacks: progress (cancellation), trace, profile and WAL commit.
//!
//! The callbacks receive a raw pointer to the handle's [`HookState`], which
//! the handle keeps alive in an `Arc` for longer than its native connection.

use crate::ffi;
use std::collections::BTreeMap;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tidesql_core::{CancellationObserver, Error};

/// Number of virtual machine instructions between cancellation polls.
pub(crate) const PROGRESS_INTERVAL: c_int = 1000;

/// Context passed to trace and WAL listeners.
#[derive(Debug, Clone, Copy)]
pub struct TraceContext<'a> {
    pub path: &'a str,
    pub handle_id: u64,
    pub tag: Option<&'a str>,
}

/// Called with each statement as it starts running.
pub type SqlTraceHook = Arc<dyn Fn(TraceContext<'_>, &str) + Send + Sync>;
/// Called with each statement and its wall time once it finishes.
pub type PerformanceHook = Arc<dyn Fn(TraceContext<'_>, &str, Duration) + Send + Sync>;
/// Called after a commit with the number of frames now in the WAL.
pub type WalCommitHook = Arc<dyn Fn(TraceContext<'_>, u32) + Send + Sync>;
/// Called with every error a handle records.
pub type ErrorObserver = Arc<dyn Fn(TraceContext<'_>, &Error) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    sql: BTreeMap<String, SqlTraceHook>,
    performance: BTreeMap<String, PerformanceHook>,
    wal_commit: BTreeMap<String, WalCommitHook>,
    error: Option<ErrorObserver>,
}

pub(crate) struct HookState {
    path: String,
    handle_id: u64,
    tag: Mutex<Option<String>>,
    cancellation: Mutex<Option<CancellationObserver>>,
    has_cancellation: AtomicBool,
    listeners: Mutex<Listeners>,
}

impl HookState {
    pub(crate) fn new(path: String, handle_id: u64) -> Self {
        Self {
            path,
            handle_id,
            tag: Mutex::new(None),
            cancellation: Mutex::new(None),
            has_cancellation: AtomicBool::new(false),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub(crate) fn tag(&self) -> Option<String> {
        self.tag.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_tag(&self, tag: Option<String>) {
        *self.tag.lock().unwrap_or_else(PoisonError::into_inner) = tag;
    }

    fn with_context<R>(&self, f: impl FnOnce(TraceContext<'_>) -> R) -> R {
        let tag = self.tag();
        f(TraceContext {
            path: &self.path,
            handle_id: self.handle_id,
            tag: tag.as_deref(),
        })
    }

    pub(crate) fn attach_cancellation(&self, observer: CancellationObserver) {
        *self
            .cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
        self.has_cancellation.store(true, Ordering::Release);
    }

    pub(crate) fn detach_cancellation(&self) {
        self.has_cancellation.store(false, Ordering::Release);
        *self
            .cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        if !self.has_cancellation.load(Ordering::Acquire) {
            return false;
        }
        self.cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(CancellationObserver::is_cancelled)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the trace mask the engine should now use.
    pub(crate) fn set_sql_trace(&self, name: &str, hook: Option<SqlTraceHook>) -> c_uint {
        let mut listeners = self.lock_listeners();
        match hook {
            Some(hook) => {
                listeners.sql.insert(name.to_string(), hook);
            }
            None => {
                listeners.sql.remove(name);
            }
        }
        trace_mask(&listeners)
    }

    pub(crate) fn set_performance_trace(
        &self,
        name: &str,
        hook: Option<PerformanceHook>,
    ) -> c_uint {
        let mut listeners = self.lock_listeners();
        match hook {
            Some(hook) => {
                listeners.performance.insert(name.to_string(), hook);
            }
            None => {
                listeners.performance.remove(name);
            }
        }
        trace_mask(&listeners)
    }

    /// Returns whether any WAL listener remains.
    pub(crate) fn set_wal_commit(&self, name: &str, hook: Option<WalCommitHook>) -> bool {
        let mut listeners = self.lock_listeners();
        match hook {
            Some(hook) => {
                listeners.wal_commit.insert(name.to_string(), hook);
            }
            None => {
                listeners.wal_commit.remove(name);
            }
        }
        !listeners.wal_commit.is_empty()
    }

    pub(crate) fn set_error_observer(&self, observer: Option<ErrorObserver>) {
        self.lock_listeners().error = observer;
    }

    pub(crate) fn emit_error(&self, error: &Error) {
        let observer = self.lock_listeners().error.clone();
        if let Some(observer) = observer {
            self.with_context(|ctx| observer(ctx, error));
        }
    }

    fn emit_sql(&self, sql: &str) {
        let hooks: Vec<_> = self.lock_listeners().sql.values().cloned().collect();
        self.with_context(|ctx| {
            for hook in &hooks {
                hook(ctx, sql);
            }
        });
    }

    fn emit_performance(&self, sql: &str, elapsed: Duration) {
        let hooks: Vec<_> = self.lock_listeners().performance.values().cloned().collect();
        self.with_context(|ctx| {
            for hook in &hooks {
                hook(ctx, sql, elapsed);
            }
        });
    }

    fn emit_wal_commit(&self, frames: u32) {
        let hooks: Vec<_> = self.lock_listeners().wal_commit.values().cloned().collect();
        self.with_context(|ctx| {
            for hook in &hooks {
                hook(ctx, frames);
            }
        });
    }
}

fn trace_mask(listeners: &Listeners) -> c_uint {
    let mut mask = 0;
    if !listeners.sql.is_empty() {
        mask |= ffi::SQLITE_TRACE_STMT as c_uint;
    }
    if !listeners.performance.is_empty() {
        mask |= ffi::SQLITE_TRACE_PROFILE as c_uint;
    }
    mask
}

/// # Safety
/// `ctx` must point to a live `HookState`.
pub(crate) unsafe extern "C" fn progress_callback(ctx: *mut c_void) -> c_int {
    // SAFETY: ctx is the HookState registered with the connection
    let state = unsafe { &*(ctx as *const HookState) };
    catch_unwind(AssertUnwindSafe(|| c_int::from(state.is_cancelled()))).unwrap_or(1)
}

/// # Safety
/// `ctx` must point to a live `HookState`; `p`/`x` follow the
/// `sqlite3_trace_v2` contract for the given event.
pub(crate) unsafe extern "C" fn trace_callback(
    event: c_uint,
    ctx: *mut c_void,
    p: *mut c_void,
    x: *mut c_void,
) -> c_int {
    // SAFETY: ctx is the HookState registered with the connection
    let state = unsafe { &*(ctx as *const HookState) };
    let stmt = p.cast::<ffi::sqlite3_stmt>();
    let _ = catch_unwind(AssertUnwindSafe(|| match event {
        ffi::SQLITE_TRACE_STMT => {
            // SAFETY: x is the statement's (unexpanded) SQL text
            let text = unsafe { c_text(x.cast::<c_char>()) };
            // Trigger sub-statements arrive as "-- ..." comments.
            let sql = if text.starts_with("--") {
                // SAFETY: stmt is live for the duration of the callback
                unsafe { c_text(ffi::sqlite3_sql(stmt)) }
            } else {
                text
            };
            state.emit_sql(&sql);
        }
        ffi::SQLITE_TRACE_PROFILE => {
            // SAFETY: x points to the elapsed nanoseconds
            let nanos = unsafe { *x.cast::<i64>() };
            // SAFETY: stmt is live for the duration of the callback
            let sql = unsafe { c_text(ffi::sqlite3_sql(stmt)) };
            state.emit_performance(&sql, Duration::from_nanos(u64::try_from(nanos).unwrap_or(0)));
        }
        _ => {}
    }));
    0
}

/// # Safety
/// `ctx` must point to a live `HookState`.
pub(crate) unsafe extern "C" fn wal_callback(
    ctx: *mut c_void,
    _db: *mut ffi::sqlite3,
    _schema: *const c_char,
    frames: c_int,
) -> c_int {
    // SAFETY: ctx is the HookState registered with the connection
    let state = unsafe { &*(ctx as *const HookState) };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        state.emit_wal_commit(u32::try_from(frames).unwrap_or(0));
    }));
    ffi::SQLITE_OK
}

unsafe fn c_text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: caller guarantees a NUL-terminated string
    unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesql_core::CancellationSignal;

    #[test]
    fn cancellation_follows_signal() {
        let state = HookState::new(":memory:".to_string(), 1);
        assert!(!state.is_cancelled());

        let signal = CancellationSignal::new();
        state.attach_cancellation(signal.observer());
        assert!(!state.is_cancelled());
        signal.cancel();
        assert!(state.is_cancelled());

        state.detach_cancellation();
        assert!(!state.is_cancelled());
    }

    #[test]
    fn dropped_signal_never_cancels() {
        let state = HookState::new(":memory:".to_string(), 1);
        let signal = CancellationSignal::new();
        state.attach_cancellation(signal.observer());
        drop(signal);
        assert!(!state.is_cancelled());
    }

    #[test]
    fn trace_mask_tracks_listeners() {
        let state = HookState::new(":memory:".to_string(), 1);
        let hook: SqlTraceHook = Arc::new(|_: TraceContext<'_>, _: &str| {});
        let perf: PerformanceHook = Arc::new(|_: TraceContext<'_>, _: &str, _: Duration| {});

        let mask = state.set_sql_trace("a", Some(hook));
        assert_eq!(mask, ffi::SQLITE_TRACE_STMT as c_uint);
        let mask = state.set_performance_trace("b", Some(perf));
        assert_eq!(mask, (ffi::SQLITE_TRACE_STMT | ffi::SQLITE_TRACE_PROFILE) as c_uint);
        let mask = state.set_sql_trace("a", None);
        assert_eq!(mask, ffi::SQLITE_TRACE_PROFILE as c_uint);
    }
}
