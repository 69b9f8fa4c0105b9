//! Cooperative cancellation of long-running statements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A flag another thread can raise to interrupt work on a handle.
///
/// A handle only keeps a weak [`CancellationObserver`]; dropping the signal
/// is the same as never cancelling.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Visible to observers at their next poll.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clear the flag so the signal can be reused.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn observer(&self) -> CancellationObserver {
        CancellationObserver {
            flag: Arc::downgrade(&self.flag),
        }
    }
}

/// Weak view of a [`CancellationSignal`].
#[derive(Debug, Clone)]
pub struct CancellationObserver {
    flag: Weak<AtomicBool>,
}

impl CancellationObserver {
    /// True only while the signal is alive and raised.
    pub fn is_cancelled(&self) -> bool {
        self.flag
            .upgrade()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// True once the owning signal has been dropped.
    pub fn is_orphaned(&self) -> bool {
        self.flag.strong_count() == 0
    }
}
