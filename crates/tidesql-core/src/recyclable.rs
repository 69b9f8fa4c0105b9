//! Shared ownership with a release action.
//!
//! A [`Recyclable`] wraps a value together with a callback that receives the
//! value back when the last clone is dropped. The pool uses it to return
//! handles to their idle list without callers doing any bookkeeping.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

type RecycleFn<T> = Box<dyn FnOnce(T) + Send>;

struct Shared<T> {
    value: ManuallyDrop<T>,
    recycle: Mutex<Option<RecycleFn<T>>>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // SAFETY: `value` is never touched again after this point; Drop for
        // Shared runs exactly once, when the last Arc clone goes away.
        #[allow(unsafe_code)]
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        let recycle = self
            .recycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match recycle {
            Some(recycle) => recycle(value),
            None => drop(value),
        }
    }
}

/// A reference-counted value that is handed to a release callback exactly
/// once, on whichever thread drops the last clone.
pub struct Recyclable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Recyclable<T> {
    /// Wrap `value`; `recycle` receives it back when the last clone drops.
    pub fn new(value: T, recycle: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: ManuallyDrop::new(value),
                recycle: Mutex::new(Some(Box::new(recycle))),
            }),
        }
    }

    /// Wrap `value` with no release action; it is simply dropped.
    pub fn detached(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: ManuallyDrop::new(value),
                recycle: Mutex::new(None),
            }),
        }
    }

    /// Number of live clones.
    pub fn ref_count(this: &Self) -> usize {
        Arc::strong_count(&this.shared)
    }
}

impl<T> Clone for Recyclable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Deref for Recyclable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Recyclable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recyclable")
            .field("value", &*self.shared.value)
            .field("refs", &Arc::strong_count(&self.shared))
            .finish()
    }
}
