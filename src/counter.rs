//! RefCounter: a thread-safe reference count wrapped around an owned payload.
//!
//! The counter knows nothing about namespaces. The registry keeps one per
//! live namespace and hands clones of the surrounding `Arc` to attachments,
//! so the count can be read without taking the registry lock.

use parking_lot::Mutex;

#[derive(Debug)]
pub struct RefCounter<T> {
    data: T,
    count: Mutex<usize>,
}

impl<T> RefCounter<T> {
    /// Wrap `data`. The count starts at zero.
    pub fn new(data: T) -> Self {
        Self {
            data,
            count: Mutex::new(0),
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_inner(self) -> T {
        self.data
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Add one reference and return the new count.
    pub fn increment(&self) -> usize {
        let mut c = self.count.lock();
        // Follow Rc semantics: abort on overflow rather than continue unsafely.
        *c = c.checked_add(1).unwrap_or_else(|| std::process::abort());
        *c
    }

    /// Drop one reference and return the new count. Saturates at zero.
    pub fn decrement(&self) -> usize {
        let mut c = self.count.lock();
        if *c > 0 {
            *c -= 1;
        }
        *c
    }
}
