//! Lock-Protocol Cell
//!
//! The state core serializes all cache mutation under one process-wide
//! reentrant mutex (the "states lock"). Reentrancy is required because
//! dropping a reference can cascade through paired cache entries and
//! destroy further states from inside the same critical section, but a
//! reentrant mutex can only ever hand out shared access to its contents.
//!
//! [`GuardedCell`] bridges the gap: a `RefCell` whose accessors demand a
//! [`StatesGuard`], i.e. proof that the caller holds the states lock. The
//! guard provides thread exclusion; the `RefCell` enforces the remaining
//! aliasing discipline within a thread, so a destructor cascade that would
//! otherwise alias a live borrow fails loudly instead of being undefined
//! behavior. Callers must never hold a borrow across a call that can
//! cascade (composition-cache removal, reference drops).

use std::cell::{Ref, RefCell, RefMut};

use parking_lot::ReentrantMutexGuard;

/// Proof of holding the global states lock. Constructed only by the
/// interner's `lock()`.
pub(crate) struct StatesGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl<'a> StatesGuard<'a> {
    pub(crate) fn new(guard: ReentrantMutexGuard<'a, ()>) -> Self {
        Self { _guard: guard }
    }
}

/// Interior-mutable storage gated on the states lock.
pub(crate) struct GuardedCell<T> {
    inner: RefCell<T>,
}

// SAFETY: every borrow goes through a `StatesGuard`, so at most one thread
// can touch the RefCell at a time. Reentrant access from the same thread is
// policed by the RefCell itself.
unsafe impl<T: Send> Sync for GuardedCell<T> {}

impl<T> GuardedCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    pub(crate) fn borrow<'a>(&'a self, _proof: &'a StatesGuard<'_>) -> Ref<'a, T> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut<'a>(&'a self, _proof: &'a StatesGuard<'_>) -> RefMut<'a, T> {
        self.inner.borrow_mut()
    }

    /// Borrow without lock proof, for single-threaded initialization of an
    /// object that has not been published yet.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other thread can reach this cell.
    pub(crate) unsafe fn borrow_mut_unguarded(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}
