//! nsregistry: a namespace-scoped, reference-counted registry of shared
//! resource bundles.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let independent callers in one process share a heavyweight
//!   bundle (collaborators plus a dedicated background thread) per string
//!   namespace, with exclusive creation and deterministic teardown.
//! - Layers:
//!   - SlotTable<V>: structural map from namespace to slot with stable
//!     generational handles, so an attachment finds its own entry without
//!     re-hashing and never touches a newer entry under the same name.
//!   - RefCounter<T>: thread-safe count around an owned payload; floors
//!     at zero.
//!   - Registry<F>: one lock over the table; attach/mark/detach state
//!     machine; hands out `Attachment` tokens that detach on drop.
//!   - Executor / HandlerThread: the start/submit/stop/join capability a
//!     bundle exposes so teardown can stop its background thread.
//!
//! Constraints
//! - Thread-safe: every registry operation takes one `parking_lot` mutex
//!   for its whole duration.
//! - At most one live bundle per namespace. Construction happens inside
//!   the lock, so racing first attaches cannot both build.
//! - Sharing is opt-in: a live namespace is re-attachable only when marked
//!   pending removal with at most one holder (resurrection). Otherwise
//!   attach fails with `AlreadyExists`.
//! - Teardown is best effort: executor stop failures and panics are logged
//!   through `tracing` and swallowed; the namespace is removed regardless.
//! - Teardown is split: `Executor::stop` only signals and runs under the
//!   lock; `Executor::join` waits for the worker after the lock is released,
//!   so jobs draining on that worker may still call into the registry.
//!
//! Reentrancy policy
//! - Factories and `Executor::stop` run under the registry lock and must
//!   not call back into the same registry. Debug builds detect this and panic
//!   instead of deadlocking; release builds do not check.
//!
//! Notes and non-goals
//! - Bundle contents are opaque; the registry only stops their executor.
//! - No global instance: construct a `Registry` and pass clones around.
//! - `Registry::shutdown` tears everything down explicitly; attachments
//!   outliving it become inert.

pub mod bundle;
mod counter;
pub mod executor;
mod reentrancy;
mod registry;
mod slot_table;

// Public surface
pub use bundle::{Bundle, BundleFactory, HandlerBundle, HandlerBundleError, HandlerBundleFactory};
pub use counter::RefCounter;
pub use executor::{Executor, ExecutorConfig, ExecutorError, HandlerThread, Job, StopMode};
pub use registry::{AttachError, Attachment, Registry};
