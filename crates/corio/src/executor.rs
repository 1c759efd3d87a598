// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded executor bound to one reactor.
//!
//! The executor keeps every in-flight root frame alive in a pending table
//! and drives frames from a ready queue. Wakers only enqueue ids; the
//! trampoline (`run_ready`) is the single place frames get resumed, and it
//! refuses to nest, so resumption never recurses through wakers or
//! reactor callbacks.
//!
//! While any root is pending the reactor also watches a wake eventfd.
//! Wakers called from other threads signal it, which interrupts the wait
//! and gets the trampoline running on the owning thread.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak as ArcWeak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::eventfd::EventFd;
use crate::reactor::{Callback, EpollReactor, Reactor, Registration};
use crate::task::{Frame, Task, TaskId};

type ReadyQueue = Mutex<VecDeque<TaskId>>;

/// Waker that puts a root back on the ready queue.
struct TaskWaker {
    id: TaskId,
    /// Set while the id sits in the queue, so repeated wakes enqueue once.
    queued: AtomicBool,
    queue: ArcWeak<ReadyQueue>,
    /// Executor's wake eventfd, rung for wakes from foreign threads.
    wake: Arc<EventFd>,
    owner: ThreadId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(queue) = self.queue.upgrade() else { return };
        queue.lock().push_back(self.id);
        if thread::current().id() != self.owner {
            self.wake.signal();
        }
    }
}

struct RootEntry {
    /// `None` while the frame is being resumed.
    frame: Option<Box<dyn Frame>>,
    waker: Arc<TaskWaker>,
}

struct Inner {
    reactor: Rc<dyn Reactor>,
    roots: RefCell<HashMap<TaskId, RootEntry>>,
    ready: Arc<ReadyQueue>,
    draining: Cell<bool>,
    stop_when_idle: Cell<bool>,
    failed: Cell<usize>,
    wake: Arc<EventFd>,
    /// Watch on `wake`, held while the pending table is non-empty.
    wake_watch: Cell<Option<Registration>>,
}

/// Resets the drain flag even if a frame's destructor unwinds.
struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Inner {
    fn run_task<T: 'static>(self: &Rc<Self>, mut task: Task<T>) -> TaskId {
        let id = task.id();
        if task.is_done() {
            warn!(task = %id, "task handed to executor after it completed");
            return id;
        }

        let weak: Weak<Inner> = Rc::downgrade(self);
        task.set_teardown(move || {
            if let Some(inner) = weak.upgrade() {
                inner.roots.borrow_mut().remove(&id);
            }
            trace!(task = %id, "root released");
        });

        let waker = Arc::new(TaskWaker {
            id,
            queued: AtomicBool::new(true),
            queue: Arc::downgrade(&self.ready),
            wake: self.wake.clone(),
            owner: thread::current().id(),
        });
        self.roots.borrow_mut().insert(
            id,
            RootEntry {
                frame: Some(Box::new(task)),
                waker,
            },
        );
        self.ready.lock().push_back(id);
        debug!(task = %id, "root task started");

        self.run_ready();
        id
    }

    /// The trampoline: resume queued roots until none is ready.
    fn run_ready(self: &Rc<Self>) {
        if self.draining.replace(true) {
            // An outer pass is active and will see whatever was queued.
            return;
        }
        let guard = DrainGuard(&self.draining);

        loop {
            let next = self.ready.lock().pop_front();
            let Some(id) = next else { break };

            let taken = {
                let mut roots = self.roots.borrow_mut();
                roots
                    .get_mut(&id)
                    .and_then(|entry| entry.frame.take().map(|f| (f, entry.waker.clone())))
            };
            // Stale wake for a root that already finished.
            let Some((mut frame, waker)) = taken else { continue };
            debug_assert_eq!(frame.id(), id);

            waker.queued.store(false, Ordering::Release);
            let waker = Waker::from(waker);
            let mut cx = Context::from_waker(&waker);

            match frame.resume(&mut cx) {
                Poll::Pending => {
                    if let Some(entry) = self.roots.borrow_mut().get_mut(&id) {
                        entry.frame = Some(frame);
                    }
                }
                Poll::Ready(()) => {
                    // The teardown hook already erased the table entry.
                    match frame.failure() {
                        Some(err) => {
                            self.failed.set(self.failed.get() + 1);
                            error!(task = %id, error = %err, "task failed");
                        }
                        None => debug!(task = %id, "task completed"),
                    }
                    drop(frame);
                }
            }
        }

        drop(guard);
        self.sync_wake_watch();
        if self.stop_when_idle.get() && self.roots.borrow().is_empty() {
            self.reactor.stop();
        }
    }

    /// Keep the wake eventfd watched exactly while some root is pending.
    ///
    /// Without pending roots the reactor must be free to run dry; with
    /// them, a wake from another thread has to be able to end the wait.
    fn sync_wake_watch(self: &Rc<Self>) {
        let idle = self.roots.borrow().is_empty();
        match self.wake_watch.take() {
            Some(reg) if idle => {
                self.reactor.deregister(reg);
                trace!("wake watch disarmed");
            }
            Some(reg) => self.wake_watch.set(Some(reg)),
            None if idle => {}
            None => {
                let weak = Rc::downgrade(self);
                let fired = self.callback(move || {
                    if let Some(inner) = weak.upgrade() {
                        // One-shot: the trampoline pass after this re-arms.
                        inner.wake_watch.set(None);
                        inner.wake.drain();
                    }
                });
                match self.reactor.register_readiness(self.wake.raw_fd(), fired) {
                    Ok(reg) => {
                        self.wake_watch.set(Some(reg));
                        trace!("wake watch armed");
                    }
                    Err(err) => {
                        warn!(error = %err, "cannot watch the wake eventfd; foreign wakes will stall");
                    }
                }
            }
        }
    }

    fn stop_when_idle(&self) {
        self.stop_when_idle.set(true);
        if self.roots.borrow().is_empty() {
            self.reactor.stop();
        }
    }

    /// Wrap a reactor callback so the trampoline runs after it.
    fn callback(self: &Rc<Self>, action: impl FnOnce() + 'static) -> Callback {
        let weak = Rc::downgrade(self);
        Box::new(move || {
            action();
            if let Some(inner) = weak.upgrade() {
                inner.run_ready();
            }
        })
    }
}

/// Owns one reactor and the frames running on it.
///
/// Not `Send`: an executor lives and dies on the thread that runs its
/// reactor. Dropping it destroys every frame still pending.
pub struct Executor {
    inner: Rc<Inner>,
}

impl Executor {
    /// Executor driving `reactor`, which must be used from this thread only.
    ///
    /// Fails if the wake eventfd cannot be created.
    pub fn new(reactor: Rc<dyn Reactor>) -> Result<Self, RuntimeError> {
        let wake = EventFd::new().map_err(RuntimeError::Notify)?;
        Ok(Self {
            inner: Rc::new(Inner {
                reactor,
                roots: RefCell::new(HashMap::new()),
                ready: Arc::new(Mutex::new(VecDeque::new())),
                draining: Cell::new(false),
                stop_when_idle: Cell::new(false),
                failed: Cell::new(0),
                wake: Arc::new(wake),
                wake_watch: Cell::new(None),
            }),
        })
    }

    /// Executor over the bundled epoll reactor.
    pub fn with_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let reactor = EpollReactor::with_capacity(config.max_events).map_err(RuntimeError::Reactor)?;
        Self::new(Rc::new(reactor))
    }

    /// A cloneable handle for starting roots and registering watches from
    /// inside coroutines.
    pub fn handle(&self) -> Handle {
        Handle {
            inner: self.inner.clone(),
        }
    }

    /// The reactor this executor drives.
    pub fn reactor(&self) -> &Rc<dyn Reactor> {
        &self.inner.reactor
    }

    /// Start a root frame. It runs synchronously up to its first
    /// suspension and stays in the pending table until it completes.
    pub fn run_task<T: 'static>(&self, task: Task<T>) -> TaskId {
        self.inner.run_task(task)
    }

    /// Start a root from a closure. The closure receives this executor's
    /// [`Handle`]; captured state must be owned since the frame outlives
    /// the call.
    pub fn run_fn<F, Fut>(&self, f: F) -> TaskId
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future + 'static,
        Fut::Output: 'static,
    {
        self.inner.run_task(Task::new(f(self.handle())))
    }

    /// Root frames started but not yet completed.
    pub fn pending_count(&self) -> usize {
        self.inner.roots.borrow().len()
    }

    /// Root frames that ended in a panic.
    pub fn failed_count(&self) -> usize {
        self.inner.failed.get()
    }

    /// Drive the reactor until it is stopped or has nothing left to watch.
    pub fn run(&self) -> Result<(), RuntimeError> {
        self.inner.reactor.run().map_err(RuntimeError::Reactor)
    }

    /// Drive the reactor until every pending root has completed.
    ///
    /// Returns early, with roots still pending, only if the reactor is
    /// stopped explicitly.
    pub fn run_until_idle(&self) -> Result<(), RuntimeError> {
        if self.pending_count() == 0 {
            return Ok(());
        }
        self.inner.stop_when_idle.set(true);
        let result = self.run();
        self.inner.stop_when_idle.set(false);
        let pending = self.pending_count();
        if result.is_ok() && pending > 0 {
            debug!(pending, "reactor stopped before the executor went idle");
        }
        result
    }

    /// Make the current or next [`run`](Self::run) return after the
    /// callback in progress.
    pub fn stop(&self) {
        self.inner.reactor.stop();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Frames are dropped outside the borrow: their awaiters deregister
        // from the reactor and may touch the table.
        let roots = std::mem::take(&mut *self.inner.roots.borrow_mut());
        if !roots.is_empty() {
            debug!(pending = roots.len(), "dropping executor with pending tasks");
        }
        drop(roots);
        self.inner.ready.lock().clear();
        self.inner.sync_wake_watch();
    }
}

/// Thread-affine handle to an [`Executor`].
///
/// Coroutines use it to start further roots and to register reactor
/// watches whose callbacks re-enter the trampoline.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<Inner>,
}

impl Handle {
    /// Start a root frame on the owning executor; see
    /// [`Executor::run_task`].
    pub fn run_task<T: 'static>(&self, task: Task<T>) -> TaskId {
        self.inner.run_task(task)
    }

    /// Start a root from a closure that receives a clone of this handle.
    /// Called from inside a running frame, the new root starts once that
    /// frame yields.
    pub fn run_fn<F, Fut>(&self, f: F) -> TaskId
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future + 'static,
        Fut::Output: 'static,
    {
        self.inner.run_task(Task::new(f(self.clone())))
    }

    /// Root frames started on the owning executor and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.inner.roots.borrow().len()
    }

    /// Stop the reactor as soon as no root is pending.
    pub fn stop_when_idle(&self) {
        self.inner.stop_when_idle();
    }

    /// Stop the reactor now, pending roots or not.
    pub fn stop(&self) {
        self.inner.reactor.stop();
    }

    /// The owning executor's reactor.
    pub fn reactor(&self) -> &Rc<dyn Reactor> {
        &self.inner.reactor
    }

    /// Run `action` once `fd` becomes readable, then run the trampoline.
    /// The watch is one-shot.
    pub fn register_readiness(
        &self,
        fd: RawFd,
        action: impl FnOnce() + 'static,
    ) -> Result<Registration, RuntimeError> {
        self.inner
            .reactor
            .register_readiness(fd, self.inner.callback(action))
            .map_err(|err| {
                warn!(fd, error = %err, "readiness registration refused");
                RuntimeError::Registration(err)
            })
    }

    /// Run `action` once `after` has elapsed, then run the trampoline.
    pub fn register_timer(
        &self,
        after: Duration,
        action: impl FnOnce() + 'static,
    ) -> Result<Registration, RuntimeError> {
        self.inner
            .reactor
            .register_timer(after, self.inner.callback(action))
            .map_err(|err| {
                warn!(?after, error = %err, "timer registration refused");
                RuntimeError::Registration(err)
            })
    }

    /// Cancel a watch that has not fired yet. Stale registrations are
    /// ignored.
    pub fn deregister(&self, registration: Registration) {
        self.inner.reactor.deregister(registration);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::sleep;
    use std::cell::RefCell;

    fn executor() -> Executor {
        Executor::with_config(&RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn synchronous_root_never_lingers() {
        let exec = executor();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        exec.run_fn(move |_| async move { r.set(true) });
        assert!(ran.get());
        assert_eq!(exec.pending_count(), 0);
    }

    #[test]
    fn suspended_root_is_tracked_until_done() {
        let exec = executor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        exec.run_fn(move |h| async move {
            l.borrow_mut().push("start");
            sleep(&h, Duration::from_millis(5)).await.unwrap();
            l.borrow_mut().push("end");
        });

        assert_eq!(*log.borrow(), vec!["start"]);
        assert_eq!(exec.pending_count(), 1);

        exec.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["start", "end"]);
        assert_eq!(exec.pending_count(), 0);
    }

    #[test]
    fn failed_root_is_reported_and_released() {
        let exec = executor();
        exec.run_fn(|h| async move {
            sleep(&h, Duration::from_millis(1)).await.unwrap();
            panic!("root blew up");
        });
        exec.run_fn(|_| async { panic!("immediately") });

        assert_eq!(exec.failed_count(), 1);
        exec.run_until_idle().unwrap();
        assert_eq!(exec.failed_count(), 2);
        assert_eq!(exec.pending_count(), 0);
    }

    #[test]
    fn roots_started_from_a_running_frame() {
        let exec = executor();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        exec.run_fn(move |h| async move {
            o.borrow_mut().push(1);
            let o2 = o.clone();
            h.run_fn(move |_| async move { o2.borrow_mut().push(3) });
            o.borrow_mut().push(2);
        });
        // The nested root starts once the outer frame yields the thread.
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert_eq!(exec.pending_count(), 0);
    }

    #[test]
    fn deep_call_chain_completes() {
        fn depth(h: Handle, n: u32) -> Task<u32> {
            Task::new(async move {
                if n == 0 {
                    sleep(&h, Duration::from_millis(1)).await.unwrap();
                    0
                } else {
                    depth(h, n - 1).await + 1
                }
            })
        }

        let exec = executor();
        let out = Rc::new(Cell::new(0));
        let o = out.clone();
        exec.run_fn(move |h| async move { o.set(depth(h, 200).await) });
        exec.run_until_idle().unwrap();
        assert_eq!(out.get(), 200);
    }

    #[test]
    fn dropping_executor_cancels_pending_frames() {
        let exec = executor();
        let alive = Rc::new(());
        let held = alive.clone();
        exec.run_fn(move |h| async move {
            let _held = held;
            sleep(&h, Duration::from_secs(3600)).await.unwrap();
        });
        assert_eq!(Rc::strong_count(&alive), 2);
        drop(exec);
        assert_eq!(Rc::strong_count(&alive), 1);
    }

    /// Hands its resume action to a thread that fires it later.
    struct ResumeElsewhere(Duration);

    impl crate::awaiter::Awaiter for ResumeElsewhere {
        type Output = ();

        fn on_suspend(&mut self, resume: crate::awaiter::Resume) -> Result<(), RuntimeError> {
            let after = self.0;
            thread::spawn(move || {
                thread::sleep(after);
                resume.resume();
            });
            Ok(())
        }

        fn result(&mut self) {}
    }

    #[test]
    fn resume_from_another_thread_reaches_the_frame() {
        let exec = executor();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        exec.run_fn(move |_| async move {
            crate::awaiter::suspend(ResumeElsewhere(Duration::from_millis(10)))
                .await
                .unwrap();
            d.set(true);
        });
        assert_eq!(exec.pending_count(), 1);

        exec.run_until_idle().unwrap();
        assert!(done.get());
        assert_eq!(exec.pending_count(), 0);
    }

    #[test]
    fn wake_watch_is_held_only_while_roots_pend() {
        let reactor = Rc::new(EpollReactor::new().unwrap());
        let exec = Executor::new(reactor.clone()).unwrap();
        exec.run_fn(|_| async {});
        assert_eq!(reactor.registered(), 0);

        exec.run_fn(|h| async move {
            sleep(&h, Duration::from_millis(1)).await.unwrap();
        });
        assert_eq!(reactor.registered(), 2);
        exec.run_until_idle().unwrap();
        assert_eq!(reactor.registered(), 0);
    }

    #[test]
    fn run_task_accepts_prebuilt_tasks() {
        let exec = executor();
        let h = exec.handle();
        let task = Task::new(async move {
            sleep(&h, Duration::from_millis(1)).await.unwrap();
            42
        });
        let id = task.id();
        assert_eq!(exec.run_task(task), id);
        assert_eq!(exec.pending_count(), 1);
        exec.run_until_idle().unwrap();
        assert_eq!(exec.pending_count(), 0);
    }
}
