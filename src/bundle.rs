//! Bundle and factory seams.
//!
//! A bundle is whatever set of collaborators a namespace shares (queues,
//! stores, schedulers). The registry never looks inside; it only needs the
//! bundle's executor so the teardown hook can stop it.

use crate::executor::{Executor, ExecutorConfig, ExecutorError, HandlerThread};
use core::fmt;
use core::ops::Deref;

/// A namespace-scoped resource bundle.
pub trait Bundle: Send + Sync + 'static {
    /// The background executor stopped when the bundle is torn down.
    fn executor(&self) -> &dyn Executor;
}

/// Builds the bundle for a namespace on its first attach.
///
/// `build` runs while the registry lock is held, so it must not call back
/// into the same registry.
pub trait BundleFactory: Send + Sync + 'static {
    type Config;
    type Bundle: Bundle;
    type Error: std::error::Error + Send + Sync + 'static;

    fn build(&self, namespace: &str, config: &Self::Config) -> Result<Self::Bundle, Self::Error>;
}

/// Stock bundle: a started `HandlerThread` plus a caller-defined payload.
pub struct HandlerBundle<T> {
    namespace: String,
    handler: HandlerThread,
    payload: T,
}

impl<T> HandlerBundle<T> {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn handler(&self) -> &HandlerThread {
        &self.handler
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T> Deref for HandlerBundle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T: Send + Sync + 'static> Bundle for HandlerBundle<T> {
    fn executor(&self) -> &dyn Executor {
        &self.handler
    }
}

impl<T: fmt::Debug> fmt::Debug for HandlerBundle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBundle")
            .field("namespace", &self.namespace)
            .field("handler", &self.handler)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Error from `HandlerBundleFactory`: either the handler thread could not
/// start or the payload constructor failed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerBundleError<E> {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("failed to build bundle payload")]
    Payload(#[source] E),
}

/// Factory producing `HandlerBundle`s from a payload constructor.
///
/// The payload is built before the handler thread is spawned, so a failing
/// constructor never leaves a thread behind.
pub struct HandlerBundleFactory<F> {
    make_payload: F,
}

impl<F> HandlerBundleFactory<F> {
    pub fn new(make_payload: F) -> Self {
        Self { make_payload }
    }
}

impl<F, T, E> BundleFactory for HandlerBundleFactory<F>
where
    F: Fn(&str, &ExecutorConfig) -> Result<T, E> + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Config = ExecutorConfig;
    type Bundle = HandlerBundle<T>;
    type Error = HandlerBundleError<E>;

    fn build(&self, namespace: &str, config: &ExecutorConfig) -> Result<Self::Bundle, Self::Error> {
        let payload = (self.make_payload)(namespace, config).map_err(HandlerBundleError::Payload)?;
        let handler = HandlerThread::spawn(namespace, config)?;
        Ok(HandlerBundle {
            namespace: namespace.to_string(),
            handler,
            payload,
        })
    }
}
