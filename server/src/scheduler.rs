//! Affinity-aware task scheduler
//!
//! A fixed pool of OS threads, each owning its own FIFO queue, lock and
//! condition variable. Tasks submitted with an affinity key always land on the
//! same worker (`hash(key) % workers`), so tasks sharing a key run one after
//! another in submission order while tasks with different keys may run in
//! parallel. Keyless tasks are spread round-robin.
//!
//! Handlers for a connection are keyed by its connection id, which is what
//! gives every client an ordered view of its own requests.

use crate::error::SchedulerError;
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct WorkerQueue {
    tasks: Mutex<VecDeque<Task>>,
    available: Condvar,
}

struct Shared {
    queues: Vec<WorkerQueue>,
    stopped: AtomicBool,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
}

impl Scheduler {
    /// Starts `workers` threads (at least one).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            queues: (0..workers)
                .map(|_| WorkerQueue {
                    tasks: Mutex::new(VecDeque::new()),
                    available: Condvar::new(),
                })
                .collect(),
            stopped: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("scheduler-worker-{}", index))
                .spawn(move || worker_loop(shared, index))?;
            handles.push(handle);
        }

        info!("Scheduler started with {} workers", workers);

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Worker index a key is pinned to for the lifetime of the process
    pub fn worker_for<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.worker_count() as u64) as usize
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Queues `task` on the worker owning `key`.
    pub fn submit<K, F>(&self, key: K, task: F) -> Result<(), SchedulerError>
    where
        K: Hash,
        F: FnOnce() + Send + 'static,
    {
        let index = self.worker_for(&key);
        self.push(index, Box::new(task))
    }

    /// Queues `task` on the next worker in round-robin order.
    pub fn submit_any<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_count();
        self.push(index, Box::new(task))
    }

    fn push(&self, index: usize, task: Task) -> Result<(), SchedulerError> {
        let queue = &self.shared.queues[index];
        let mut tasks = queue.tasks.lock();
        // Checked under the queue lock so a worker never exits with work left behind
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        tasks.push_back(task);
        drop(tasks);
        queue.available.notify_one();
        Ok(())
    }

    /// Stops accepting work, lets every worker drain its queue, and joins them.
    ///
    /// Safe to call more than once and from any thread, including a worker.
    pub fn shutdown(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            info!("Scheduler shutting down");
        }

        for queue in &self.shared.queues {
            let _guard = queue.tasks.lock();
            queue.available.notify_all();
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Scheduler worker exited abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let queue = &shared.queues[index];

    loop {
        let task = {
            let mut tasks = queue.tasks.lock();
            loop {
                if let Some(task) = tasks.pop_front() {
                    break task;
                }
                if shared.stopped.load(Ordering::SeqCst) {
                    debug!("Scheduler worker {} drained and exiting", index);
                    return;
                }
                queue.available.wait(&mut tasks);
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                "Task panicked on scheduler worker {}: {}",
                index,
                panic_message(payload.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
