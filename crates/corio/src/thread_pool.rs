// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A fixed set of single-threaded executors.
//!
//! Each worker thread owns one reactor and one executor for its whole
//! life. Submitted work is dealt out round robin and never migrates.
//! Jobs reach a worker through a locked queue plus an eventfd doorbell
//! watched by that worker's reactor.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::eventfd::EventFd;
use crate::executor::{Executor, Handle};

type Job = Box<dyn FnOnce(&Handle) + Send + 'static>;

struct Worker {
    id: usize,
    jobs: Mutex<VecDeque<Job>>,
    doorbell: EventFd,
    stopping: AtomicBool,
}

impl Worker {
    fn submit(&self, job: Job) {
        self.jobs.lock().push_back(job);
        self.doorbell.signal();
    }
}

struct Dispatch {
    next: usize,
    stopped: bool,
}

/// `n` executors, one per OS thread.
pub struct ThreadPool {
    workers: Vec<Arc<Worker>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    dispatch: Mutex<Dispatch>,
}

impl ThreadPool {
    /// Start `n` workers with default settings. `0` means one per core.
    pub fn new(n: usize) -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::default().workers(n))
    }

    /// Start the workers described by `config`: count, thread names and
    /// stack size. Fails if a doorbell eventfd or a thread cannot be
    /// created; workers already started are stopped and joined first.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let count = config.resolved_workers();
        let mut workers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);

        for id in 0..count {
            let worker = Arc::new(Worker {
                id,
                jobs: Mutex::new(VecDeque::new()),
                doorbell: EventFd::new().map_err(RuntimeError::Notify)?,
                stopping: AtomicBool::new(false),
            });

            let mut builder =
                thread::Builder::new().name(format!("{}-{}", config.thread_name, id));
            if let Some(bytes) = config.stack_size {
                builder = builder.stack_size(bytes);
            }
            let w = worker.clone();
            let cfg = config.clone();
            let spawned = builder.spawn(move || {
                if let Err(err) = worker_main(&w, &cfg) {
                    error!(worker = w.id, error = %err, "worker exited with an error");
                }
            });

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    // Let the workers already running wind down.
                    stop_and_join(&workers, threads);
                    return Err(RuntimeError::Spawn(err));
                }
            }
            workers.push(worker);
        }

        debug!(workers = count, "thread pool started");
        Ok(Self {
            workers,
            threads: Mutex::new(threads),
            dispatch: Mutex::new(Dispatch {
                next: 0,
                stopped: false,
            }),
        })
    }

    /// Submit a root coroutine. The closure runs on the chosen worker and
    /// receives that worker's [`Handle`]. Returns the worker index.
    pub fn add<F, Fut>(&self, f: F) -> usize
    where
        F: FnOnce(Handle) -> Fut + Send + 'static,
        Fut: Future + 'static,
        Fut::Output: 'static,
    {
        self.dispatch(Box::new(move |handle: &Handle| {
            let id = handle.run_fn(f);
            trace!(task = %id, "job started");
        }))
    }

    /// Submit an already-built future.
    pub fn add_task<F>(&self, future: F) -> usize
    where
        F: Future + Send + 'static,
        F::Output: 'static,
    {
        self.add(move |_| future)
    }

    /// Number of worker threads.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True for a pool started with no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every submitted coroutine to finish, then join the worker
    /// threads. Work submitted afterwards is discarded.
    pub fn shutdown(&self) {
        {
            let mut dispatch = self.dispatch.lock();
            if dispatch.stopped {
                return;
            }
            dispatch.stopped = true;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        stop_and_join(&self.workers, threads);
        debug!("thread pool shut down");
    }

    fn dispatch(&self, job: Job) -> usize {
        let mut dispatch = self.dispatch.lock();
        let idx = dispatch.next % self.workers.len().max(1);
        if dispatch.stopped || self.workers.is_empty() {
            warn!("job submitted to a stopped thread pool; discarding");
            return idx;
        }
        dispatch.next = dispatch.next.wrapping_add(1);
        self.workers[idx].submit(job);
        idx
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .field("stopped", &self.dispatch.lock().stopped)
            .finish()
    }
}

fn stop_and_join(workers: &[Arc<Worker>], threads: Vec<thread::JoinHandle<()>>) {
    for worker in workers {
        worker.stopping.store(true, Ordering::Release);
        worker.doorbell.signal();
    }
    for handle in threads {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
}

fn worker_main(worker: &Arc<Worker>, config: &RuntimeConfig) -> Result<(), RuntimeError> {
    let executor = Executor::with_config(config)?;
    let handle = executor.handle();
    debug!(worker = worker.id, "worker started");

    arm_doorbell(&handle, worker)?;
    executor.run()?;

    debug!(
        worker = worker.id,
        failed = executor.failed_count(),
        "worker stopped"
    );
    Ok(())
}

/// Watch the doorbell once; the callback drains the job queue and re-arms
/// unless the pool is stopping.
///
/// `stopping` is read before the queue is drained. Every accepted job is
/// pushed before the flag is raised, so a `true` here means the drain below
/// sees all of them; anything pushed while the batch runs rings the bell
/// again and is picked up after re-arming.
fn arm_doorbell(handle: &Handle, worker: &Arc<Worker>) -> Result<(), RuntimeError> {
    let h = handle.clone();
    let w = worker.clone();
    handle.register_readiness(worker.doorbell.raw_fd(), move || {
        let stopping = w.stopping.load(Ordering::Acquire);
        w.doorbell.drain();
        let jobs: Vec<Job> = w.jobs.lock().drain(..).collect();
        for job in jobs {
            job(&h);
        }

        if stopping {
            h.stop_when_idle();
        } else if let Err(err) = arm_doorbell(&h, &w) {
            error!(worker = w.id, error = %err, "failed to re-arm doorbell");
            h.stop_when_idle();
        }
    })?;
    Ok(())
}
