//! Fixed-size worker pool shared by every scan engine.
//!
//! Two submission modes: fire-and-forget with a pool-wide idle barrier, and
//! promise submission returning a handle whose `wait` blocks for the task's
//! result. Tasks may submit further tasks from inside the pool; the queue is
//! unbounded so recursive submission cannot deadlock.
//!
//! Panic containment relies on `catch_unwind`, so every build profile must
//! keep the default `panic = "unwind"`. With `panic = "abort"` a panicking
//! task would take the whole scan down instead of failing its own slot.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;

use crossbeam_channel as channel;
use parking_lot::{Condvar, Mutex};

use crate::core::errors::{GlassError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct BarrierState {
    pending: Mutex<usize>,
    idle: Condvar,
}

/// Handle to a fixed-size FIFO task executor. Cloning is cheap; the workers
/// exit when the last handle drops.
#[derive(Clone)]
pub struct WorkerPool {
    tx: channel::Sender<Job>,
    state: Arc<BarrierState>,
}

/// Completion handle for a promise submission.
pub struct Promise<T> {
    rx: channel::Receiver<Result<T>>,
}

impl<T> Promise<T> {
    /// Block until the task finishes, yielding its result or the failure of
    /// the task that was supposed to produce it.
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(GlassError::TaskFailed {
                details: "worker dropped before completing the task".to_string(),
            })
        })
    }
}

impl WorkerPool {
    /// Spawn a pool with `workers` threads (clamped to at least one).
    ///
    /// Workers hold only the receiving half of the queue, so they drain
    /// and exit once the last pool handle drops.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let state = Arc::new(BarrierState {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });

        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("dg-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                        let mut pending = state.pending.lock();
                        *pending -= 1;
                        if *pending == 0 {
                            state.idle.notify_all();
                        }
                    }
                })
                .expect("failed to spawn pool worker");
        }

        Self { tx, state }
    }

    /// Submit a fire-and-forget task. A panicking task is confined to its
    /// own slot and reported on stderr.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.enqueue(Box::new(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                eprintln!("[DG-POOL] task panicked: {}", panic_message(&payload));
            }
        }));
    }

    /// Submit a task and obtain a completion handle for its result.
    pub fn submit_promise<T, F>(&self, job: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        self.enqueue(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
                GlassError::TaskFailed {
                    details: panic_message(&payload),
                }
            });
            let _ = tx.send(result);
        }));
        Promise { rx }
    }

    /// Block until every submitted task (including tasks submitted from
    /// inside other tasks) has finished.
    pub fn wait_idle(&self) {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.idle.wait(&mut pending);
        }
    }

    fn enqueue(&self, job: Job) {
        // The count rises before the send so the idle barrier can never
        // observe zero while a recursive child is mid-enqueue.
        *self.state.pending.lock() += 1;
        if self.tx.send(job).is_err() {
            let mut pending = self.state.pending.lock();
            *pending -= 1;
            if *pending == 0 {
                self.state.idle.notify_all();
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "unknown panic payload".to_string())
        },
        |message| (*message).to_string(),
    )
}
