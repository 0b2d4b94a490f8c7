//! Lazily started, memoized values computed off the calling thread.
//!
//! An [`AsyncCell`] wraps exactly one computation:
//!
//! ```text
//!   pending ──start()──▶ running ──▶ completed(value)
//!      │                    │    └──▶ failed(CellError)
//!      └──────cancel()──────┴──────▶ cancelled
//! ```
//!
//! The pending → running edge is a compare-and-swap on the cell state, so
//! racing `start()` calls run the computation once. Terminal states are
//! written once under the slot lock; waiters park on a condvar.
//!
//! Work runs on an [`Executor`]. [`BlockingPool`] is the in-process
//! implementation: a dedicated tokio runtime whose blocking pool runs the
//! jobs. A plain `tokio::runtime::Handle` is also an executor, for hosts
//! that already own a runtime.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pool: Arc<dyn Executor> = Arc::new(BlockingPool::new("fragments", 8)?);
//! let text = AsyncCell::lazy("readme", pool, || std::fs::read_to_string("README.md").unwrap_or_default());
//!
//! assert!(text.peek().is_none());            // peeking never starts work
//! let lines = text.map(|t| t.lines().count());
//! let n = lines.await_timeout(Duration::from_secs(2))?;   // blocking, bounded
//! ```

use crate::error::CellError;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

// ============================================
// Executors
// ============================================

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run cell computations.
///
/// Implementations must either run the job or drop it; a dropped job
/// completes its cell as [`CellError::Cancelled`].
pub trait Executor: Send + Sync {
    fn execute(&self, label: &str, job: Job);
}

impl Executor for Handle {
    fn execute(&self, _label: &str, job: Job) {
        self.spawn_blocking(job);
    }
}

/// A dedicated, bounded pool of blocking worker threads.
///
/// Backed by its own multi-threaded tokio runtime so async coordinators
/// (see the diff warm-up) can share it with plain blocking jobs.
pub struct BlockingPool {
    name: String,
    runtime: Option<Runtime>,
    handle: Handle,
}

impl BlockingPool {
    /// Create a pool running at most `threads` jobs at once.
    pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name(format!("{}-pool", name))
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        tracing::debug!(pool = name, threads, "Worker pool started");

        Ok(Self {
            name: name.to_string(),
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime handle, for spawning async coordinators onto this pool.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Executor for BlockingPool {
    fn execute(&self, label: &str, job: Job) {
        tracing::trace!(pool = %self.name, label, "Submitting job");
        self.handle.spawn_blocking(job);
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        // Never block here: the last owner may be one of our own workers.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingPool").field("name", &self.name).finish()
    }
}

// ============================================
// AsyncCell
// ============================================

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

type Outcome<T> = Result<T, CellError>;
type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;
type Starter<T> = Box<dyn FnOnce(Completer<T>) + Send>;

struct Slot<T: Clone + Send + 'static> {
    outcome: Option<Outcome<T>>,
    listeners: Vec<Listener<T>>,
}

struct Inner<T: Clone + Send + 'static> {
    key: String,
    state: AtomicU8,
    starter: Mutex<Option<Starter<T>>>,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the terminal outcome. Returns false if one was already written.
    fn finish(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut slot = self.slot();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            self.state.store(DONE, Ordering::Release);
            self.ready.notify_all();
            std::mem::take(&mut slot.listeners)
        };

        if let Err(e) = &outcome {
            tracing::debug!(cell = %self.key, error = %e, "Cell finished with error");
        }

        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&outcome))) {
                tracing::warn!(
                    cell = %self.key,
                    panic = %panic_message(payload.as_ref()),
                    "Completion callback panicked"
                );
            }
        }
        true
    }
}

/// Write handle for a running cell, given to the cell's starter.
///
/// Dropping it without calling [`Completer::complete`] cancels the cell,
/// so a job that is discarded by its executor never leaves waiters hanging.
pub struct Completer<T: Clone + Send + 'static> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T: Clone + Send + 'static> Completer<T> {
    pub fn key(&self) -> &str {
        self.inner.as_ref().map(|i| i.key.as_str()).unwrap_or("")
    }

    pub fn complete(mut self, outcome: Result<T, CellError>) {
        if let Some(inner) = self.inner.take() {
            inner.finish(outcome);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.finish(Err(CellError::Cancelled));
        }
    }
}

/// A lazily started, memoized, cancellable value.
///
/// Cloning a cell is cheap and yields another handle to the same
/// computation. The key is for diagnostics only; it plays no part in
/// equality.
pub struct AsyncCell<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> Clone for AsyncCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncCell<T> {
    fn with_state(key: String, state: u8, starter: Option<Starter<T>>, outcome: Option<Outcome<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                state: AtomicU8::new(state),
                starter: Mutex::new(starter),
                slot: Mutex::new(Slot {
                    outcome,
                    listeners: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// A cell whose value is already known. No work is ever scheduled.
    pub fn completed(key: impl Into<String>, value: T) -> Self {
        Self::with_state(key.into(), DONE, None, Some(Ok(value)))
    }

    /// A cell that has already failed.
    pub fn failed(key: impl Into<String>, error: CellError) -> Self {
        Self::with_state(key.into(), DONE, None, Some(Err(error)))
    }

    /// A pending cell whose `starter` runs once, on the first `start()`.
    ///
    /// The starter must not block; it hands the [`Completer`] to whatever
    /// produces the value.
    pub fn deferred<S>(key: impl Into<String>, starter: S) -> Self
    where
        S: FnOnce(Completer<T>) + Send + 'static,
    {
        Self::with_state(key.into(), PENDING, Some(Box::new(starter)), None)
    }

    /// A running cell completed through the returned [`Completer`].
    ///
    /// For callers that compute the value on a thread they already own.
    pub fn promise(key: impl Into<String>) -> (Self, Completer<T>) {
        let cell = Self::with_state(key.into(), RUNNING, None, None);
        let completer = Completer {
            inner: Some(Arc::clone(&cell.inner)),
        };
        (cell, completer)
    }

    /// A pending cell computing `compute()` on `executor` once started.
    pub fn lazy<F>(key: impl Into<String>, executor: Arc<dyn Executor>, compute: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::try_lazy(key, executor, move || Ok::<T, CellError>(compute()))
    }

    /// Like [`AsyncCell::lazy`] for fallible computations.
    pub fn try_lazy<F, E>(key: impl Into<String>, executor: Arc<dyn Executor>, compute: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<CellError>,
    {
        Self::deferred(key, move |completer: Completer<T>| {
            let label = completer.key().to_string();
            // The job keeps its executor alive until it has run.
            let keep_alive = Arc::clone(&executor);
            executor.execute(
                &label,
                Box::new(move || {
                    let _executor = keep_alive;
                    let outcome = match panic::catch_unwind(AssertUnwindSafe(compute)) {
                        Ok(result) => result.map_err(Into::into),
                        Err(payload) => Err(CellError::Panicked(panic_message(payload.as_ref()))),
                    };
                    completer.complete(outcome);
                }),
            );
        })
    }

    /// A started cell computing `compute()` on `executor`.
    pub fn spawn<F>(key: impl Into<String>, executor: Arc<dyn Executor>, compute: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let cell = Self::lazy(key, executor, compute);
        cell.start();
        cell
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Begin the computation if it has not begun. Idempotent, never blocks.
    pub fn start(&self) {
        if self
            .inner
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let starter = self
            .inner
            .starter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(starter) = starter {
            starter(Completer {
                inner: Some(Arc::clone(&self.inner)),
            });
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != PENDING
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == DONE
    }

    /// The value, iff the cell already completed successfully.
    ///
    /// Never blocks and never starts the computation. Failures read as
    /// "not ready".
    pub fn peek(&self) -> Option<T> {
        match self.peek_outcome() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    /// The terminal outcome, iff the cell is terminal. Never blocks.
    pub fn peek_outcome(&self) -> Option<Result<T, CellError>> {
        if !self.is_done() {
            return None;
        }
        self.inner.slot().outcome.clone()
    }

    /// `peek()`, or `fallback` when the value is not ready.
    pub fn peek_or(&self, fallback: T) -> T {
        self.peek().unwrap_or(fallback)
    }

    /// Start if needed and wait up to `timeout` for the value.
    ///
    /// # Blocking
    ///
    /// Parks the calling thread for at most `timeout`. Returns `Ok(None)`
    /// on timeout or cancellation, `Err` if the computation failed.
    pub fn await_timeout(&self, timeout: Duration) -> Result<Option<T>, CellError> {
        self.start();
        let slot = self.inner.slot();
        let (slot, _) = self
            .inner
            .ready
            .wait_timeout_while(slot, timeout, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        match &slot.outcome {
            None | Some(Err(CellError::Cancelled)) => Ok(None),
            Some(Ok(value)) => Ok(Some(value.clone())),
            Some(Err(e)) => Err(e.clone()),
        }
    }

    /// Start if needed and wait for the terminal outcome.
    ///
    /// # Blocking
    ///
    /// Unbounded. Prefer [`AsyncCell::await_timeout`] on interactive threads.
    pub fn join(&self) -> Result<T, CellError> {
        self.start();
        let slot = self.inner.slot();
        let slot = self
            .inner
            .ready
            .wait_while(slot, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);

        slot.outcome.clone().unwrap_or(Err(CellError::Cancelled))
    }

    /// Run `callback` once the cell is terminal.
    ///
    /// Fires immediately, on the calling thread, if the cell already is.
    /// Otherwise it runs on whichever thread finishes the cell. Does not
    /// start the computation.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, CellError>) + Send + 'static,
    {
        let mut slot = self.inner.slot();
        if let Some(outcome) = slot.outcome.clone() {
            drop(slot);
            callback(&outcome);
            return;
        }
        slot.listeners.push(Box::new(callback));
    }

    /// A new cell holding `f(value)`, computed when the new cell is started.
    ///
    /// Starting the mapped cell starts this one. Failures propagate.
    pub fn map<U, F>(&self, f: F) -> AsyncCell<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        AsyncCell::deferred(format!("{}.map", self.key()), move |completer: Completer<U>| {
            source.on_complete(move |outcome| {
                let mapped = match outcome.clone() {
                    Ok(value) => panic::catch_unwind(AssertUnwindSafe(|| f(value)))
                        .map_err(|payload| CellError::Panicked(panic_message(payload.as_ref()))),
                    Err(e) => Err(e),
                };
                completer.complete(mapped);
            });
            source.start();
        })
    }

    /// Cancel the cell unless it is already terminal.
    ///
    /// A computation already running is not interrupted; its result is
    /// discarded. Returns true if this call cancelled the cell.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        let _ = self
            .inner
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire);
        drop(
            self.inner
                .starter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.inner.finish(Err(CellError::Cancelled))
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for AsyncCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            PENDING => "pending",
            RUNNING => "running",
            _ => "done",
        };
        f.debug_struct("AsyncCell")
            .field("key", &self.inner.key)
            .field("state", &state)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    fn pool() -> Arc<dyn Executor> {
        Arc::new(BlockingPool::new("cell-test", 4).unwrap())
    }

    struct DiscardJobs;

    impl Executor for DiscardJobs {
        fn execute(&self, _label: &str, job: Job) {
            drop(job);
        }
    }

    #[test]
    fn test_single_evaluation_under_racing_starts() {
        let executor = pool();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cell = AsyncCell::lazy("answer", Arc::clone(&executor), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            42
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    cell.start();
                    cell.join().unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_peek_does_not_start_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cell = AsyncCell::lazy("idle", pool(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            1
        });

        assert_eq!(cell.peek(), None);
        assert!(!cell.is_started());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_peek_never_blocks_on_slow_computation() {
        let (release, gate) = mpsc::channel::<()>();
        let cell = AsyncCell::lazy("slow", pool(), move || {
            let _ = gate.recv_timeout(Duration::from_secs(10));
            "done".to_string()
        });
        cell.start();

        let started = Instant::now();
        assert_eq!(cell.peek(), None);
        assert!(started.elapsed() < Duration::from_millis(500));

        release.send(()).unwrap();
        assert_eq!(cell.join().unwrap(), "done");
        assert_eq!(cell.peek().as_deref(), Some("done"));
    }

    #[test]
    fn test_await_timeout_returns_none_without_error() {
        let (release, gate) = mpsc::channel::<()>();
        let cell = AsyncCell::lazy("gated", pool(), move || {
            let _ = gate.recv_timeout(Duration::from_secs(10));
            7
        });

        assert_eq!(cell.await_timeout(Duration::from_millis(20)), Ok(None));
        release.send(()).unwrap();
        assert_eq!(cell.await_timeout(Duration::from_secs(5)), Ok(Some(7)));
    }

    #[test]
    fn test_completed_cell_fires_callback_immediately() {
        let cell = AsyncCell::completed("known", 5);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cell.on_complete(move |outcome| sink.lock().unwrap().push(outcome.clone()));

        assert_eq!(*seen.lock().unwrap(), vec![Ok(5)]);
        assert!(cell.is_done());
    }

    #[test]
    fn test_on_complete_fires_once_for_pending_cell() {
        let (release, gate) = mpsc::channel::<()>();
        let cell = AsyncCell::lazy("later", pool(), move || {
            let _ = gate.recv_timeout(Duration::from_secs(10));
            3
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cell.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cell.start();
        release.send(()).unwrap();
        cell.join().unwrap();
        cell.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_surfaces_on_join_not_peek() {
        let cell: AsyncCell<u32> =
            AsyncCell::try_lazy("broken", pool(), || Err(CellError::Failed("boom".to_string())));

        assert_eq!(cell.join(), Err(CellError::Failed("boom".to_string())));
        assert_eq!(cell.peek(), None);
        assert!(cell.is_done());
        assert!(cell.await_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_panic_is_captured() {
        let cell: AsyncCell<u32> = AsyncCell::lazy("panics", pool(), || panic!("kaboom"));

        match cell.join() {
            Err(CellError::Panicked(message)) => assert!(message.contains("kaboom")),
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[test]
    fn test_map_is_lazy_and_memoized() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let source = AsyncCell::lazy("source", pool(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            21
        });
        let doubled = source.map(|v| v * 2);

        assert!(!source.is_started());
        assert_eq!(doubled.join().unwrap(), 42);
        assert_eq!(doubled.join().unwrap(), 42);
        assert_eq!(source.join().unwrap(), 21);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_map_propagates_failure() {
        let source: AsyncCell<u32> = AsyncCell::failed("bad", CellError::Failed("nope".to_string()));
        let mapped = source.map(|v| v + 1);
        assert_eq!(mapped.join(), Err(CellError::Failed("nope".to_string())));
    }

    #[test]
    fn test_cancel_pending_cell() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cell = AsyncCell::lazy("cancelled", pool(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            1
        });

        assert!(cell.cancel());
        assert!(!cell.cancel());
        assert_eq!(cell.await_timeout(Duration::from_millis(10)), Ok(None));
        assert_eq!(cell.join(), Err(CellError::Cancelled));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_job_cancels_cell() {
        let cell = AsyncCell::lazy("discarded", Arc::new(DiscardJobs), || 1);
        assert_eq!(cell.join(), Err(CellError::Cancelled));
    }

    #[test]
    fn test_promise_is_completed_by_its_owner() {
        let (cell, completer) = AsyncCell::<u32>::promise("owned");
        assert!(cell.is_started());
        cell.start();
        assert_eq!(cell.await_timeout(Duration::from_millis(20)).unwrap(), None);

        let waiter = {
            let cell = cell.clone();
            std::thread::spawn(move || cell.join())
        };
        completer.complete(Ok(9));
        assert_eq!(waiter.join().unwrap(), Ok(9));

        let (abandoned, completer) = AsyncCell::<u32>::promise("abandoned");
        drop(completer);
        assert_eq!(abandoned.join(), Err(CellError::Cancelled));
    }

    #[test]
    fn test_handle_is_an_executor() {
        let pool = BlockingPool::new("handle-test", 2).unwrap();
        let executor: Arc<dyn Executor> = Arc::new(pool.handle().clone());
        let cell = AsyncCell::spawn("via-handle", executor, || "ok");
        assert_eq!(cell.join().unwrap(), "ok");
    }
}
