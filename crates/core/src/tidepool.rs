//! TidePool - bounded, elastic worker pool for blocking offloads
//!
//! Fibers must never block their mesh thread, so blocking work is handed
//! to this pool via `await_blocking`. A controller thread spawns the
//! initial workers and rebalances every 100 ms: shrink while fewer than
//! `LOW_WATER` items are scheduled and more than `NUM_WORKERS` workers
//! exist, grow while the backlog exceeds the worker count, up to
//! `MAX_WORKERS`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

pub const NUM_WORKERS: usize = 8;
pub const LOW_WATER: usize = 4;
pub const MAX_WORKERS: usize = 32;

const CONTROL_INTERVAL: Duration = Duration::from_millis(100);
const WORKER_WAIT: Duration = Duration::from_millis(50);

/// Worker thread stack size; blocking calls may nest deep.
const WORKER_STACK_SIZE: usize = 0x10_0000;

pub type Work = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Work>>,
    cond: Condvar,
    scheduled: AtomicUsize,
    running: AtomicBool,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(shared: Arc<Shared>) -> Worker {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name("tidepool-worker".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                while flag.load(Ordering::Acquire) && shared.running.load(Ordering::Acquire) {
                    let work = shared.queue.lock().unwrap().pop_front();
                    if let Some(work) = work {
                        // a panicking work item must not take the worker down
                        let _ = catch_unwind(AssertUnwindSafe(work));
                        shared.scheduled.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    // wait if the queue is empty
                    let guard = shared.queue.lock().unwrap();
                    if guard.is_empty() {
                        let _ = shared.cond.wait_timeout(guard, WORKER_WAIT);
                    }
                }
            })
            .expect("failed to spawn TidePool worker");
        Worker { running, handle }
    }
}

pub struct TidePool {
    shared: Arc<Shared>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TidePool {
    fn default() -> Self {
        Self::new()
    }
}

impl TidePool {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            scheduled: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });
        let controller_shared = shared.clone();
        let controller = std::thread::Builder::new()
            .name("tidepool-controller".to_string())
            .spawn(move || controller_loop(controller_shared))
            .expect("failed to spawn TidePool controller");
        Self { shared, controller: Mutex::new(Some(controller)) }
    }

    /// Queue a work item. The pool takes ownership and runs it on some
    /// worker thread; completion signalling is the caller's business.
    pub fn schedule(&self, work: Work) {
        self.shared.scheduled.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.lock().unwrap().push_back(work);
        self.shared.cond.notify_one();
    }

    /// Items queued or currently executing.
    pub fn scheduled(&self) -> usize {
        self.shared.scheduled.load(Ordering::Acquire)
    }
}

fn controller_loop(shared: Arc<Shared>) {
    // spawn workers first
    let mut workers: Vec<Worker> = (0..NUM_WORKERS).map(|_| Worker::spawn(shared.clone())).collect();

    while shared.running.load(Ordering::Acquire) {
        debug_assert!(workers.len() >= NUM_WORKERS);

        let scheduled = shared.scheduled.load(Ordering::Acquire);
        if scheduled < LOW_WATER && workers.len() > NUM_WORKERS {
            // more workers than the backlog justifies
            let superfluous = workers.pop().expect("worker list cannot be empty here");
            superfluous.running.store(false, Ordering::Release);
            // we don't know which worker waits where, notify them all
            shared.cond.notify_all();
            let _ = superfluous.handle.join();
            tracing::trace!(count = workers.len(), "TidePool worker removed");
        } else if scheduled > workers.len() && workers.len() < MAX_WORKERS {
            workers.push(Worker::spawn(shared.clone()));
            tracing::trace!(count = workers.len(), "TidePool worker added");
        }

        std::thread::sleep(CONTROL_INTERVAL);
    }

    // stop all workers; flag them all before waking them
    for worker in &workers {
        worker.running.store(false, Ordering::Release);
    }
    shared.cond.notify_all();
    for worker in workers {
        let _ = worker.handle.join();
    }
}

impl Drop for TidePool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        if let Some(controller) = self.controller.lock().unwrap().take() {
            let _ = controller.join();
        }
    }
}

static TIDE_POOL: OnceLock<TidePool> = OnceLock::new();

/// The process-wide pool, created on first use.
pub fn tide_pool() -> &'static TidePool {
    TIDE_POOL.get_or_init(TidePool::new)
}
