// Demand-driven worker pool.
//
// Tasks go through a single FIFO; a dedicated manager thread is the only
// creator and joiner of workers. Worker count is bounded by four knobs:
// `min_workers <= workers <= max_workers` and the idle band
// `min_idle ..= max_idle` (a `max_idle` of 0 disables idle shedding).
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub min_idle: usize,
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            min_idle: 1,
            max_idle: 4,
        }
    }
}

struct TaskState {
    tasks: VecDeque<Task>,
    closing: bool,
    workers: usize,
    active: usize,
    min_workers: usize,
    max_workers: usize,
    min_idle: usize,
    max_idle: usize,
}

impl TaskState {
    fn idle(&self) -> usize {
        self.workers - self.active
    }

    fn worker_should_exit(&self) -> bool {
        self.max_idle != 0
            && ((self.idle() > self.max_idle && self.workers > self.min_workers)
                || self.workers > self.max_workers)
    }

    fn new_workers_needed(&self) -> usize {
        if self.workers < self.min_workers {
            return self.min_workers - self.workers;
        }
        if self.idle() < self.min_idle {
            let wanted = self.min_idle - self.idle();
            return wanted.min(self.max_workers.saturating_sub(self.workers));
        }
        if self.workers == self.active {
            // Everyone is busy; grow by the backlog, capped at the ceiling.
            return self
                .tasks
                .len()
                .min(self.max_workers.saturating_sub(self.workers));
        }
        0
    }
}

struct PoolShared {
    state: Mutex<TaskState>,
    tasks_cond: Condvar,
    user_cond: Condvar,
    manager_lock: Mutex<()>,
    manager_cond: Condvar,
    manager_wake: AtomicBool,
    terminated: Mutex<Vec<ThreadId>>,
    shutdown: AtomicBool,
}

impl PoolShared {
    fn notify_manager(&self) {
        self.manager_wake.store(true, Ordering::Release);
        let _guard = self.manager_lock.lock();
        self.manager_cond.notify_all();
    }

    // The mutex is taken first so a worker between its shutdown check and
    // its wait cannot miss the wakeup.
    fn wake_workers(&self) {
        drop(self.state.lock());
        self.tasks_cond.notify_all();
    }
}

/// Elastic pool of worker threads executing scheduled closures.
///
/// ```
/// use courier_pool::{PoolConfig, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::default());
/// assert!(pool.schedule(|| {}));
/// pool.wait_for_all();
/// assert_eq!(pool.active_count(), 0);
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    manager: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(TaskState {
                tasks: VecDeque::new(),
                closing: false,
                workers: 0,
                active: 0,
                min_workers: config.min_workers,
                max_workers: config.max_workers,
                min_idle: config.min_idle,
                max_idle: config.max_idle,
            }),
            tasks_cond: Condvar::new(),
            user_cond: Condvar::new(),
            manager_lock: Mutex::new(()),
            manager_cond: Condvar::new(),
            manager_wake: AtomicBool::new(false),
            terminated: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        let manager_shared = Arc::clone(&shared);
        let manager = thread::Builder::new()
            .name("pool-manager".into())
            .spawn(move || manager_loop(manager_shared))
            .expect("spawn pool manager");
        Self {
            shared,
            manager: Some(manager),
        }
    }

    /// Enqueue a task. Returns false once the pool has been stopped.
    pub fn schedule<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.closing {
                return false;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.tasks_cond.notify_one();
        self.shared.notify_manager();
        true
    }

    /// Block until the queue is empty and no worker is mid-task.
    pub fn wait_for_all(&self) {
        let mut state = self.shared.state.lock();
        while state.active != 0 || !state.tasks.is_empty() {
            self.shared.user_cond.wait(&mut state);
        }
    }

    /// Refuse new submissions; queued tasks still run.
    pub fn stop(&self) {
        self.shared.state.lock().closing = true;
    }

    /// Accept submissions again after `stop`.
    pub fn reset(&self) {
        self.shared.state.lock().closing = false;
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().workers
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().active
    }

    pub fn min_workers(&self) -> usize {
        self.shared.state.lock().min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.shared.state.lock().max_workers
    }

    pub fn min_idle(&self) -> usize {
        self.shared.state.lock().min_idle
    }

    pub fn max_idle(&self) -> usize {
        self.shared.state.lock().max_idle
    }

    pub fn set_min_workers(&self, n: usize) {
        {
            let mut state = self.shared.state.lock();
            if n > state.max_workers {
                return;
            }
            state.min_workers = n;
        }
        self.shared.notify_manager();
    }

    pub fn set_max_workers(&self, n: usize) {
        {
            let mut state = self.shared.state.lock();
            if n < state.min_workers {
                return;
            }
            state.max_workers = n;
        }
        self.shared.notify_manager();
    }

    pub fn set_min_idle(&self, n: usize) {
        self.shared.state.lock().min_idle = n;
        self.shared.notify_manager();
    }

    pub fn set_max_idle(&self, n: usize) {
        self.shared.state.lock().max_idle = n;
        self.shared.notify_manager();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify_manager();
        self.shared.wake_workers();
        if let Some(manager) = self.manager.take() {
            let _ = manager.join();
        }
    }
}

fn manager_loop(shared: Arc<PoolShared>) {
    let mut handles: HashMap<ThreadId, JoinHandle<()>> = HashMap::new();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let to_create = shared.state.lock().new_workers_needed();
        for _ in 0..to_create {
            let worker_shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name("pool-worker".into())
                .spawn(move || worker_loop(worker_shared))
            {
                Ok(handle) => {
                    shared.state.lock().workers += 1;
                    handles.insert(handle.thread().id(), handle);
                }
                Err(err) => tracing::error!(error = %err, "failed to spawn pool worker"),
            }
        }

        // Wake idle workers when the pool is over its idle band or ceiling;
        // the excess re-check their exit condition and leave.
        {
            let state = shared.state.lock();
            if state.max_idle != 0
                && (state.idle() > state.max_idle || state.workers > state.max_workers)
            {
                shared.tasks_cond.notify_all();
            }
        }

        // Join and free workers that exited.
        loop {
            let terminated = shared.terminated.lock().pop();
            let Some(id) = terminated else { break };
            if let Some(handle) = handles.remove(&id) {
                let _ = handle.join();
            }
        }

        {
            let mut guard = shared.manager_lock.lock();
            if !shared.shutdown.load(Ordering::Acquire)
                && !shared.manager_wake.swap(false, Ordering::AcqRel)
            {
                shared.manager_cond.wait(&mut guard);
            }
        }
    }

    // Teardown: wake every sleeper so it observes the shutdown flag, then
    // join whatever is left.
    shared.wake_workers();
    for (_, handle) in handles.drain() {
        let _ = handle.join();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let mut task = None;
        {
            let mut state = shared.state.lock();
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if state.tasks.is_empty() {
                if state.worker_should_exit() {
                    break;
                }
                if state.active == 0 {
                    shared.user_cond.notify_all();
                }
                shared.tasks_cond.wait(&mut state);
            } else {
                // Claimed and counted active in one critical section, so
                // `wait_for_all` never sees an empty queue with the task
                // still in flight.
                task = state.tasks.pop_front();
                state.active += 1;
            }
        }
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                tracing::error!("panic in worker pool task");
            }
            let mut state = shared.state.lock();
            state.active -= 1;
            if state.active == 0 && state.tasks.is_empty() {
                drop(state);
                shared.user_cond.notify_all();
            }
        }
    }

    {
        shared.state.lock().workers -= 1;
    }
    shared.terminated.lock().push(thread::current().id());
    shared.notify_manager();
}
