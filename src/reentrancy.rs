//! Debug-only reentrancy guard.
//!
//! The registry runs user code (bundle factories, teardown hooks) while it
//! holds its lock, and that lock is not reentrant. A factory that calls back
//! into its own registry would otherwise hang forever. In debug builds the
//! guard records which thread is inside the critical section and panics when
//! the same thread tries to enter again. In release builds it compiles to a
//! zero-cost no-op.

use core::marker::PhantomData;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-instance reentrancy tracker. Call `check` before acquiring the lock it
/// protects and hold the guard from `enter` for as long as the lock is held.
#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

impl DebugReentrancy {
    /// Create a new reentrancy tracker. Const so it can be a field default.
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(0),
        }
    }

    /// Panic (debug builds only) if the calling thread is already inside.
    #[inline]
    pub fn check(&self) {
        #[cfg(debug_assertions)]
        assert!(
            self.owner.load(Ordering::Acquire) != thread_tag(),
            "reentrancy detected: registry called from its own factory or teardown hook"
        );
    }

    /// Mark the calling thread as inside the guarded section.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            let prev = self.owner.swap(thread_tag(), Ordering::AcqRel);
            debug_assert_eq!(prev, 0, "guarded section entered while occupied");
            ReentrancyGuard {
                owner: self,
                _lt: PhantomData,
            }
        }

        #[cfg(not(debug_assertions))]
        {
            ReentrancyGuard { _lt: PhantomData }
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    _lt: PhantomData<&'a ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.owner.store(0, Ordering::Release);
    }
}

// Address of a thread-local byte: unique and non-zero for every live thread.
#[cfg(debug_assertions)]
fn thread_tag() -> usize {
    thread_local!(static TAG: u8 = const { 0 });
    TAG.with(|t| t as *const u8 as usize)
}
