//! Background executors owned by bundles.
//!
//! The registry only needs to stop an executor and later wait for it;
//! `submit` is the part bundles use. `HandlerThread` is the stock
//! implementation: one named OS thread draining a crossbeam channel of
//! boxed jobs.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Unit of work accepted by an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor has not been started")]
    NotStarted,
    #[error("executor has been stopped")]
    Stopped,
    #[error("failed to spawn executor thread")]
    Spawn(#[from] std::io::Error),
    #[error("a job on executor thread `{name}` panicked")]
    WorkerPanicked { name: String },
}

/// Start/submit/stop capability of a bundle's background executor.
pub trait Executor: Send + Sync {
    fn start(&self) -> Result<(), ExecutorError>;

    fn submit(&self, job: Job) -> Result<(), ExecutorError>;

    /// Stop accepting work and ask the worker to exit. Never waits for it.
    /// Safe to call with nothing queued and safe to call more than once.
    fn stop(&self) -> Result<(), ExecutorError>;

    /// Wait for the worker to exit after `stop`. Reports failures of the
    /// work that ran in the meantime. Executors without a thread of their
    /// own have nothing to wait for.
    fn join(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn is_running(&self) -> bool;
}

/// What happens to queued jobs when a `HandlerThread` stops.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum StopMode {
    /// Run everything already queued, then exit.
    #[default]
    Drain,
    /// Discard queued jobs; only the job in flight finishes.
    Immediate,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutorConfig {
    pub thread_name_prefix: String,
    pub stop_mode: StopMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "nsregistry".to_string(),
            stop_mode: StopMode::Drain,
        }
    }
}

impl ExecutorConfig {
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_stop_mode(mut self, mode: StopMode) -> Self {
        self.stop_mode = mode;
        self
    }

    /// Name of the worker thread serving `namespace`.
    pub fn thread_name(&self, namespace: &str) -> String {
        format!("{}_{}", self.thread_name_prefix, namespace)
    }
}

enum Message {
    Run(Job),
    Quit,
}

enum State {
    Idle,
    Running {
        tx: Sender<Message>,
        rx: Receiver<Message>,
    },
    Stopped,
}

/// A single named worker thread fed through an unbounded channel.
///
/// A panicking job is caught and logged; the worker keeps serving and the
/// next `join` reports `WorkerPanicked`.
pub struct HandlerThread {
    name: String,
    mode: StopMode,
    state: Mutex<State>,
    worker: Mutex<Option<JoinHandle<()>>>,
    panicked: Arc<AtomicBool>,
}

impl HandlerThread {
    pub fn new(name: impl Into<String>, mode: StopMode) -> Self {
        Self {
            name: name.into(),
            mode,
            state: Mutex::new(State::Idle),
            worker: Mutex::new(None),
            panicked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a handler named for `namespace` and start it.
    pub fn spawn(namespace: &str, config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let handler = Self::new(config.thread_name(namespace), config.stop_mode);
        handler.start()?;
        Ok(handler)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_mode(&self) -> StopMode {
        self.mode
    }
}

fn run_loop(name: &str, rx: Receiver<Message>, panicked: &AtomicBool) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    panicked.store(true, Ordering::SeqCst);
                    tracing::error!(executor = %name, "job panicked; worker keeps serving");
                }
            }
            Message::Quit => break,
        }
    }
}

impl Executor for HandlerThread {
    fn start(&self) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        match &*state {
            State::Running { .. } => return Ok(()),
            State::Stopped => return Err(ExecutorError::Stopped),
            State::Idle => {}
        }
        let (tx, rx) = unbounded();
        let worker_rx = rx.clone();
        let name = self.name.clone();
        let panicked = self.panicked.clone();
        let worker = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_loop(&name, worker_rx, &panicked))?;
        tracing::debug!(executor = %self.name, "executor started");
        *self.worker.lock() = Some(worker);
        *state = State::Running { tx, rx };
        Ok(())
    }

    fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        match &*self.state.lock() {
            State::Idle => Err(ExecutorError::NotStarted),
            State::Stopped => Err(ExecutorError::Stopped),
            State::Running { tx, .. } => tx
                .send(Message::Run(job))
                .map_err(|_| ExecutorError::Stopped),
        }
    }

    fn stop(&self) -> Result<(), ExecutorError> {
        let prev = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        let State::Running { tx, rx } = prev else {
            return Ok(());
        };

        // The state is already Stopped, so nothing can be queued behind Quit.
        if self.mode == StopMode::Immediate {
            let discarded = rx.try_iter().count();
            if discarded > 0 {
                tracing::debug!(executor = %self.name, discarded, "discarded queued jobs");
            }
        }
        let _ = tx.send(Message::Quit);
        tracing::debug!(executor = %self.name, "executor stop requested");
        Ok(())
    }

    /// Stops first if needed, so joining a running handler cannot hang.
    /// Returns immediately when called from the worker itself.
    fn join(&self) -> Result<(), ExecutorError> {
        self.stop()?;
        let worker = {
            let mut slot = self.worker.lock();
            if slot
                .as_ref()
                .is_some_and(|w| w.thread().id() == thread::current().id())
            {
                // Joined from one of its own jobs; the loop exits once this job returns.
                return Ok(());
            }
            slot.take()
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                self.panicked.store(true, Ordering::SeqCst);
            }
            tracing::debug!(executor = %self.name, "executor joined");
        }
        if self.panicked.swap(false, Ordering::SeqCst) {
            return Err(ExecutorError::WorkerPanicked {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), State::Running { .. })
    }
}

impl Drop for HandlerThread {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            tracing::warn!(executor = %self.name, error = %err, "executor shut down uncleanly on drop");
        }
    }
}

impl core::fmt::Debug for HandlerThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerThread")
            .field("name", &self.name)
            .field("mode", &self.stop_mode())
            .field("running", &self.is_running())
            .finish()
    }
}
