// Registry integration suite.
//
// Each test documents the behavior it verifies. The core invariants:
// - Uniqueness: at most one live bundle per namespace at any instant.
// - Ownership: a live namespace is shared only through resurrection
//   (pending removal + at most one holder).
// - Teardown: the last detach stops the bundle's executor and removes the
//   namespace; a later attach builds a fresh bundle.
// - Totality: detach and mark never fail, whatever the interleaving.
// - Liveness: work still running on a bundle's worker may use the registry
//   while that bundle is torn down; no detach waits on it under the lock.
use nsregistry::{
    AttachError, Bundle, BundleFactory, Executor, ExecutorConfig, ExecutorError,
    HandlerBundleFactory, HandlerThread, Job, Registry,
};
use crossbeam_channel::bounded;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("nsregistry=debug")
        .try_init();
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < DEADLINE, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

fn handler_registry() -> Registry<
    HandlerBundleFactory<
        impl Fn(&str, &ExecutorConfig) -> Result<String, Infallible> + Send + Sync + 'static,
    >,
> {
    Registry::new(HandlerBundleFactory::new(|ns: &str, _: &ExecutorConfig| {
        Ok::<_, Infallible>(format!("modules:{ns}"))
    }))
}

// Scenario A: a second plain attach is rejected.
#[test]
fn scenario_a_duplicate_attach_rejected() {
    init_tracing();
    let r = handler_registry();
    let config = ExecutorConfig::default();
    let b1 = r.attach("x", &config).unwrap();
    assert_eq!(b1.ref_count(), 1);
    match r.attach("x", &config) {
        Err(AttachError::AlreadyExists(ns)) => assert_eq!(ns, "x"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected duplicate attach to error"),
    }
    assert_eq!(r.ref_count("x"), 1);
}

// Scenario B: a pending namespace with one holder is resurrected.
#[test]
fn scenario_b_resurrection_returns_same_bundle() {
    init_tracing();
    let r = handler_registry();
    let config = ExecutorConfig::default();
    let b1 = r.attach("x", &config).unwrap();
    r.mark_pending_removal("x");

    let again = r.attach("x", &config).unwrap();
    assert!(b1.same_bundle(&again));
    assert_eq!(again.ref_count(), 2);
    assert!(!r.is_pending_removal("x"));

    // Both holders must go before the executor stops.
    drop(b1);
    assert!(again.handler().is_running());
    let bundle = again.bundle().clone();
    drop(again);
    assert!(!bundle.handler().is_running());
    assert!(!r.contains("x"));
}

// Scenario C: detach to zero, then attach builds a new bundle.
#[test]
fn scenario_c_reattach_after_teardown_builds_fresh_bundle() {
    init_tracing();
    let r = handler_registry();
    let config = ExecutorConfig::default().with_thread_name_prefix("fetch");
    let b1 = r.attach("x", &config).unwrap();
    assert_eq!(b1.handler().name(), "fetch_x");
    assert_eq!(b1.payload(), "modules:x");
    let old = b1.bundle().clone();
    b1.detach();

    assert!(!r.contains("x"));
    assert!(!old.handler().is_running());
    assert!(matches!(
        old.executor().submit(Box::new(|| {})),
        Err(ExecutorError::Stopped)
    ));

    let b2 = r.attach("x", &config).unwrap();
    assert!(!Arc::ptr_eq(&old, b2.bundle()));
    assert!(b2.handler().is_running());
}

// mark → detach (1 → 0) → attach: the mark is consumed by the zero-crossing
// detach, so the next attach constructs instead of resurrecting.
#[test]
fn marked_then_fully_detached_namespace_is_rebuilt() {
    let r = handler_registry();
    let config = ExecutorConfig::default();
    let b1 = r.attach("x", &config).unwrap();
    b1.mark_pending_removal();
    let old = b1.bundle().clone();
    drop(b1);
    assert!(!r.is_pending_removal("x"));

    let b2 = r.attach("x", &config).unwrap();
    assert!(!Arc::ptr_eq(&old, b2.bundle()));
    assert_eq!(b2.ref_count(), 1);
}

// The bundle's executor actually runs work on its dedicated thread.
#[test]
fn bundle_executor_runs_submitted_work() {
    let r = handler_registry();
    let a = r.attach("work", &ExecutorConfig::default()).unwrap();
    let (tx, rx) = bounded(1);
    a.executor()
        .submit(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        }))
        .unwrap();
    let name = rx.recv().unwrap();
    assert_eq!(name.as_deref(), Some("nsregistry_work"));
}

// Namespaces are independent of each other.
#[test]
fn namespaces_are_isolated() {
    let r = handler_registry();
    let config = ExecutorConfig::default();
    let a = r.attach("a", &config).unwrap();
    let b = r.attach("b", &config).unwrap();
    assert!(!a.same_bundle(&b));
    assert_eq!(r.len(), 2);
    drop(a);
    assert!(!r.contains("a"));
    assert!(r.contains("b"));
    assert!(b.handler().is_running());
}

// Registry clones share one table.
#[test]
fn clones_share_state() {
    let r = handler_registry();
    let r2 = r.clone();
    let _a = r.attach("shared", &ExecutorConfig::default()).unwrap();
    assert!(r2.contains("shared"));
    assert!(matches!(
        r2.attach("shared", &ExecutorConfig::default()),
        Err(AttachError::AlreadyExists(_))
    ));
}

// Executor whose stop is observable, used to check uniqueness under contention.
struct TrackedExecutor {
    inner: HandlerThread,
    live: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl Executor for TrackedExecutor {
    fn start(&self) -> Result<(), ExecutorError> {
        self.inner.start()
    }
    fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        self.inner.submit(job)
    }
    fn stop(&self) -> Result<(), ExecutorError> {
        let res = self.inner.stop();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        res
    }
    fn join(&self) -> Result<(), ExecutorError> {
        self.inner.join()
    }
    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

struct TrackedBundle(TrackedExecutor);

impl Bundle for TrackedBundle {
    fn executor(&self) -> &dyn Executor {
        &self.0
    }
}

#[derive(Default)]
struct TrackedFactory {
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    built: AtomicUsize,
}

impl BundleFactory for TrackedFactory {
    type Config = ExecutorConfig;
    type Bundle = TrackedBundle;
    type Error = ExecutorError;

    fn build(&self, namespace: &str, config: &ExecutorConfig) -> Result<TrackedBundle, ExecutorError> {
        let inner = HandlerThread::spawn(namespace, config)?;
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(TrackedBundle(TrackedExecutor {
            inner,
            live: self.live.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

// Many threads race attach/mark/detach on one namespace. Every successful
// attach is paired with exactly one detach; afterwards the namespace is
// absent, every constructed bundle was torn down, and no two bundles were
// ever live at the same time.
#[test]
fn concurrent_attach_detach_leaves_namespace_absent() {
    init_tracing();
    let r = Registry::new(TrackedFactory::default());
    let config = ExecutorConfig::default();
    let attached = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..8 {
            let r = r.clone();
            let config = &config;
            let attached = &attached;
            s.spawn(move || {
                for i in 0..200 {
                    match r.attach("hot", config) {
                        Ok(a) => {
                            attached.fetch_add(1, Ordering::SeqCst);
                            if (t + i) % 2 == 0 {
                                a.mark_pending_removal();
                            }
                            thread::yield_now();
                            a.detach();
                        }
                        Err(AttachError::AlreadyExists(_)) => {}
                        Err(AttachError::Factory(e)) => panic!("factory failed: {e}"),
                    }
                    if i % 17 == 0 {
                        r.mark_pending_removal("hot");
                    }
                }
            });
        }
    });

    let factory = r.factory();
    assert!(attached.load(Ordering::SeqCst) >= 1);
    assert!(factory.built.load(Ordering::SeqCst) >= 1);
    assert!(!r.contains("hot"));
    assert_eq!(r.ref_count("hot"), 0);
    assert_eq!(factory.live.load(Ordering::SeqCst), 0);
    assert_eq!(factory.max_live.load(Ordering::SeqCst), 1);
}

// Racing first attaches on a fresh namespace: exactly one builds.
#[test]
fn racing_first_attach_builds_once() {
    let r = Registry::new(TrackedFactory::default());
    let config = ExecutorConfig::default();
    let barrier = std::sync::Barrier::new(8);
    let winners: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    r.attach("cold", &config).ok()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let held: Vec<_> = winners.into_iter().flatten().collect();
    assert_eq!(held.len(), 1);
    assert_eq!(r.factory().built.load(Ordering::SeqCst), 1);
    drop(held);
    assert!(r.is_empty());
    assert_eq!(r.factory().live.load(Ordering::SeqCst), 0);
}

// Attachments can move to and be released from other threads.
#[test]
fn attachment_released_on_another_thread() {
    let r = handler_registry();
    let a = r.attach("mover", &ExecutorConfig::default()).unwrap();
    let bundle = a.bundle().clone();
    thread::spawn(move || drop(a)).join().unwrap();
    assert!(!r.contains("mover"));
    assert!(!bundle.handler().is_running());
}

// Dropping the last attachment from inside the bundle's own worker must
// not deadlock on joining that worker.
#[test]
fn last_detach_from_own_worker_thread() {
    let r = handler_registry();
    let a = r.attach("self", &ExecutorConfig::default()).unwrap();
    let bundle = a.bundle().clone();
    let (tx, rx) = bounded(1);
    bundle
        .executor()
        .submit(Box::new(move || {
            drop(a);
            tx.send(()).unwrap();
        }))
        .unwrap();
    rx.recv_timeout(DEADLINE).unwrap();
    assert!(!r.contains("self"));
    assert!(!bundle.handler().is_running());
}

// A job running on the bundle's worker reads the registry while another
// thread performs the last detach. Detach must not hold the lock while it
// waits for that job.
#[test]
fn worker_job_reads_registry_during_last_detach() {
    init_tracing();
    let r = handler_registry();
    let a = r.attach("x", &ExecutorConfig::default()).unwrap();
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (seen_tx, seen_rx) = bounded(1);
    let r2 = r.clone();
    a.executor()
        .submit(Box::new(move || {
            gate_rx.recv_timeout(DEADLINE).unwrap();
            seen_tx.send(r2.len()).unwrap();
        }))
        .unwrap();

    let (done_tx, done_rx) = bounded(1);
    let detacher = thread::spawn(move || {
        gate_tx.send(()).unwrap();
        a.detach();
        done_tx.send(()).unwrap();
    });

    done_rx.recv_timeout(DEADLINE).expect("detach did not return");
    assert!(seen_rx.recv_timeout(DEADLINE).unwrap() <= 1);
    detacher.join().unwrap();
    assert!(r.is_empty());
}

// A job still queued behind a blocked one when the last detach runs: it
// drains after "x" is removed, so its attach builds a fresh bundle, and
// the detach returns only once the old worker has finished it.
#[test]
fn queued_job_attaches_during_teardown() {
    init_tracing();
    let r = handler_registry();
    let a = r.attach("x", &ExecutorConfig::default()).unwrap();
    let old = a.bundle().clone();
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (rebuilt_tx, rebuilt_rx) = bounded(1);
    a.executor()
        .submit(Box::new(move || {
            gate_rx.recv_timeout(DEADLINE).unwrap();
        }))
        .unwrap();
    let r2 = r.clone();
    a.executor()
        .submit(Box::new(move || {
            let rebuilt = r2.attach("x", &ExecutorConfig::default());
            let fresh = rebuilt.is_ok();
            drop(rebuilt);
            rebuilt_tx.send(fresh).unwrap();
        }))
        .unwrap();

    let (done_tx, done_rx) = bounded(1);
    let detacher = thread::spawn(move || {
        a.detach();
        done_tx.send(()).unwrap();
    });

    wait_until(|| !r.contains("x"));
    assert!(!old.handler().is_running());
    // Still waiting for the old worker, which is parked at the gate.
    assert!(done_rx.try_recv().is_err());

    gate_tx.send(()).unwrap();
    assert!(rebuilt_rx.recv_timeout(DEADLINE).unwrap());
    done_rx.recv_timeout(DEADLINE).expect("detach did not return");
    detacher.join().unwrap();
    assert!(!r.contains("x"));
}

// The last detach of "a" runs while a job on a's worker drops the only
// attachment to "b". Both teardowns complete.
#[test]
fn worker_releases_other_namespace_during_last_detach() {
    init_tracing();
    let r = handler_registry();
    let config = ExecutorConfig::default();
    let a = r.attach("a", &config).unwrap();
    let b = r.attach("b", &config).unwrap();
    let b_bundle = b.bundle().clone();
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (released_tx, released_rx) = bounded(1);
    a.executor()
        .submit(Box::new(move || {
            gate_rx.recv_timeout(DEADLINE).unwrap();
            drop(b);
            released_tx.send(()).unwrap();
        }))
        .unwrap();

    let (done_tx, done_rx) = bounded(1);
    let detacher = thread::spawn(move || {
        gate_tx.send(()).unwrap();
        a.detach();
        done_tx.send(()).unwrap();
    });

    released_rx.recv_timeout(DEADLINE).expect("b was not released");
    done_rx.recv_timeout(DEADLINE).expect("detach of a did not return");
    detacher.join().unwrap();
    assert!(r.is_empty());
    assert!(!b_bundle.handler().is_running());
}
