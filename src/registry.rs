//! Registry: namespace → shared bundle, reference counted, one lock.
//!
//! Per namespace the registry is ABSENT, LIVE (count ≥ 1) or
//! PENDING_REMOVAL (count ≥ 1, flag set). Every operation holds the single
//! table lock for its whole duration, including bundle construction and the
//! stop signal of the teardown hook, so a namespace never has two bundles
//! accepting work at once. Waiting for a stopped worker to exit happens
//! after the lock is released: jobs still draining on that worker may use
//! the registry without deadlocking the detach that stopped it.

use crate::bundle::{Bundle, BundleFactory};
use crate::counter::RefCounter;
use crate::reentrancy::{DebugReentrancy, ReentrancyGuard};
use crate::slot_table::{Handle, SlotTable};
use core::fmt;
use core::ops::{Deref, DerefMut};
use parking_lot::{Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum AttachError<E> {
    /// The namespace is live and not eligible for resurrection.
    #[error("namespace `{0}` already exists")]
    AlreadyExists(String),
    /// The factory failed; the namespace stays absent.
    #[error(transparent)]
    Factory(E),
}

type SharedCounter<B> = Arc<RefCounter<Arc<B>>>;

struct Slot<B> {
    counter: SharedCounter<B>,
    pending_removal: bool,
}

struct Inner<F: BundleFactory> {
    factory: F,
    table: Mutex<SlotTable<Slot<F::Bundle>>>,
    reentrancy: DebugReentrancy,
}

// Field order matters: the reentrancy mark is cleared before the lock is released.
struct Locked<'a, B> {
    _reentry: ReentrancyGuard<'a>,
    table: MutexGuard<'a, SlotTable<Slot<B>>>,
}

impl<B> Deref for Locked<'_, B> {
    type Target = SlotTable<Slot<B>>;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl<B> DerefMut for Locked<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.table
    }
}

impl<F: BundleFactory> Inner<F> {
    fn lock(&self) -> Locked<'_, F::Bundle> {
        self.reentrancy.check();
        let table = self.table.lock();
        Locked {
            _reentry: self.reentrancy.enter(),
            table,
        }
    }

    fn detach(&self, namespace: &str, handle: Handle) {
        let mut table = self.lock();
        // A stale handle means the entry was already torn down by shutdown().
        let Some(slot) = table.get_mut(handle) else {
            debug!(namespace, "detach of stale attachment ignored");
            return;
        };
        let remaining = slot.counter.decrement();
        slot.pending_removal = false;
        if remaining > 0 {
            debug!(namespace, count = remaining, "detached");
            return;
        }
        let counter = slot.counter.clone();
        teardown(namespace, &**counter.data());
        table.remove(handle);
        drop(table);
        await_teardown(namespace, &**counter.data());
    }
}

/// Signal the bundle's executor to stop. Runs under the registry lock.
/// Failures and panics are logged, never propagated.
fn teardown<B: Bundle>(namespace: &str, bundle: &B) {
    match panic::catch_unwind(AssertUnwindSafe(|| bundle.executor().stop())) {
        Ok(Ok(())) => debug!(namespace, "bundle stop requested"),
        Ok(Err(err)) => warn!(namespace, error = %err, "bundle teardown failed; removing anyway"),
        Err(_) => error!(namespace, "bundle teardown panicked; removing anyway"),
    }
}

/// Wait for a stopped executor to exit. Must run without the registry lock.
fn await_teardown<B: Bundle>(namespace: &str, bundle: &B) {
    match panic::catch_unwind(AssertUnwindSafe(|| bundle.executor().join())) {
        Ok(Ok(())) => debug!(namespace, "bundle torn down"),
        Ok(Err(err)) => warn!(namespace, error = %err, "bundle executor exited uncleanly"),
        Err(_) => error!(namespace, "waiting for bundle executor panicked"),
    }
}

/// Process-local registry of namespace-scoped bundles.
///
/// Cloning is cheap and yields a handle to the same registry.
pub struct Registry<F: BundleFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: BundleFactory> Clone for Registry<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: BundleFactory> Registry<F> {
    pub fn new(factory: F) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                table: Mutex::new(SlotTable::new()),
                reentrancy: DebugReentrancy::new(),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Attach to `namespace`, building its bundle if the namespace is absent.
    ///
    /// A live namespace is shared only through resurrection: it must be
    /// marked pending removal and have at most one holder. Any other attach
    /// to a live namespace fails with `AlreadyExists`.
    pub fn attach(
        &self,
        namespace: &str,
        config: &F::Config,
    ) -> Result<Attachment<F>, AttachError<F::Error>> {
        let mut table = self.inner.lock();

        if let Some(handle) = table.find(namespace) {
            if let Some(slot) = table.get_mut(handle) {
                if slot.pending_removal && slot.counter.count() <= 1 {
                    slot.pending_removal = false;
                    let count = slot.counter.increment();
                    debug!(namespace, count, "resurrected namespace pending removal");
                    let counter = slot.counter.clone();
                    return Ok(Attachment::new(self.inner.clone(), namespace, handle, counter));
                }
            }
            warn!(namespace, "attach rejected: namespace already exists");
            return Err(AttachError::AlreadyExists(namespace.to_string()));
        }

        let bundle = self
            .inner
            .factory
            .build(namespace, config)
            .map_err(AttachError::Factory)?;
        let counter = Arc::new(RefCounter::new(Arc::new(bundle)));
        counter.increment();
        let slot = Slot {
            counter: counter.clone(),
            pending_removal: false,
        };
        // The lookup above and this insert share one critical section, so a
        // collision is a bug. Debug builds catch it; release builds report a
        // duplicate instead of panicking.
        debug_assert!(
            !table.contains(namespace),
            "namespace `{namespace}` appeared under the lock"
        );
        let handle = table
            .insert(namespace, slot)
            .map_err(|_| AttachError::AlreadyExists(namespace.to_string()))?;
        debug!(namespace, "bundle constructed");
        Ok(Attachment::new(self.inner.clone(), namespace, handle, counter))
    }

    /// Flag `namespace` so the next attach may resurrect it. No-op when absent.
    pub fn mark_pending_removal(&self, namespace: &str) {
        let mut table = self.inner.lock();
        if let Some(slot) = table.find(namespace).and_then(|h| table.get_mut(h)) {
            slot.pending_removal = true;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.inner.lock().contains(namespace)
    }

    /// Current holders of `namespace`; zero when absent.
    pub fn ref_count(&self, namespace: &str) -> usize {
        let table = self.inner.lock();
        table
            .find(namespace)
            .and_then(|h| table.get(h))
            .map_or(0, |slot| slot.counter.count())
    }

    pub fn is_pending_removal(&self, namespace: &str) -> bool {
        let table = self.inner.lock();
        table
            .find(namespace)
            .and_then(|h| table.get(h))
            .is_some_and(|slot| slot.pending_removal)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner
            .lock()
            .iter()
            .map(|(_, ns, _)| ns.to_string())
            .collect()
    }

    /// Tear down every live bundle and empty the registry.
    ///
    /// Attachments still outstanding become inert; dropping them later does
    /// nothing, even if their namespace has been attached again since.
    pub fn shutdown(&self) {
        let stopped: Vec<_> = {
            let mut table = self.inner.lock();
            table
                .drain()
                .map(|(namespace, slot)| {
                    teardown(&namespace, &**slot.counter.data());
                    (namespace, slot.counter)
                })
                .collect()
        };
        for (namespace, counter) in stopped {
            await_teardown(&namespace, &**counter.data());
        }
    }
}

impl<F: BundleFactory> fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

/// Ownership token for one attach. Dropping it (or calling `detach`)
/// releases exactly one reference.
pub struct Attachment<F: BundleFactory> {
    owner: Arc<Inner<F>>,
    namespace: Box<str>,
    handle: Handle,
    counter: SharedCounter<F::Bundle>,
    released: bool,
}

impl<F: BundleFactory> Attachment<F> {
    fn new(
        owner: Arc<Inner<F>>,
        namespace: &str,
        handle: Handle,
        counter: SharedCounter<F::Bundle>,
    ) -> Self {
        Self {
            owner,
            namespace: namespace.into(),
            handle,
            counter,
            released: false,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn bundle(&self) -> &Arc<F::Bundle> {
        self.counter.data()
    }

    /// Holders currently attached to this bundle. Read without the registry lock.
    pub fn ref_count(&self) -> usize {
        self.counter.count()
    }

    pub fn mark_pending_removal(&self) {
        let mut table = self.owner.lock();
        if let Some(slot) = table.get_mut(self.handle) {
            slot.pending_removal = true;
        }
    }

    /// Whether `other` shares this attachment's bundle.
    pub fn same_bundle(&self, other: &Attachment<F>) -> bool {
        Arc::ptr_eq(self.bundle(), other.bundle())
    }

    /// Release this attachment now. The last release tears the bundle down.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.owner.detach(&self.namespace, self.handle);
        }
    }
}

impl<F: BundleFactory> Deref for Attachment<F> {
    type Target = F::Bundle;

    fn deref(&self) -> &F::Bundle {
        self.bundle()
    }
}

impl<F: BundleFactory> Drop for Attachment<F> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<F: BundleFactory> fmt::Debug for Attachment<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("namespace", &self.namespace)
            .field("handle", &self.handle)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
