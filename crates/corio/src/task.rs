// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine frames.
//!
//! A [`Task`] owns one suspended computation, the slot its outcome lands
//! in, and an optional teardown hook. Awaiting a task from another
//! coroutine makes the caller the task's continuation: the caller owns the
//! callee for as long as it waits on it, so the chain of waiting frames is
//! a plain ownership chain and can never contain a cycle.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use crate::error::TaskError;

/// Stable identity of a frame, used as the key of the executor's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

pub(crate) type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

type Teardown = Box<dyn FnOnce() + 'static>;

/// Where a frame is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created or suspended; the computation has more steps.
    Running,
    /// Finished; the result slot is filled.
    Complete,
    /// The result has been extracted.
    Consumed,
}

/// Move-only handle to a coroutine frame.
///
/// Dropping the handle destroys the frame and everything it holds,
/// including awaiters still registered with a reactor.
#[must_use = "a task does nothing until it is awaited or handed to an executor"]
pub struct Task<T> {
    id: TaskId,
    frame: Option<LocalBoxFuture<T>>,
    slot: Option<Result<T, Box<dyn Any + Send>>>,
    teardown: Option<Teardown>,
    state: TaskState,
}

// `T` is only ever moved in and out of the slot, never pinned.
impl<T> Unpin for Task<T> {}

impl<T> Task<T> {
    /// Wrap `future` as a lazily started frame with a fresh id. Nothing
    /// runs until the task is awaited or handed to an executor.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        Self {
            id: TaskId::next(),
            frame: Some(Box::pin(future)),
            slot: None,
            teardown: None,
            state: TaskState::Running,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Where the frame is in its life: running, holding a result, or
    /// emptied.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// True once the frame has finished, whether or not its result was
    /// taken.
    pub fn is_done(&self) -> bool {
        self.state != TaskState::Running
    }

    /// Install the hook run exactly once when the frame completes.
    ///
    /// Installing it on a frame that already completed runs it at once, so
    /// the hook is never lost.
    pub fn set_teardown(&mut self, hook: impl FnOnce() + 'static) {
        if self.is_done() {
            hook();
        } else {
            self.teardown = Some(Box::new(hook));
        }
    }

    /// Run the frame for one step.
    ///
    /// A panic inside the frame is caught and stored like a return value.
    /// Whichever way the frame finishes, the teardown hook runs on this
    /// same path.
    pub fn resume(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let frame = match self.frame.as_mut() {
            Some(frame) => frame,
            None => panic!("{} resumed after it completed", self.id),
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| frame.as_mut().poll(cx))) {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(value)) => Ok(value),
            Err(payload) => Err(payload),
        };

        // Free the frame before anything observes completion.
        self.frame = None;
        self.slot = Some(outcome);
        self.state = TaskState::Complete;

        if let Some(hook) = self.teardown.take() {
            hook();
        }
        Poll::Ready(())
    }

    /// The failure stored in the slot, if the frame panicked.
    pub fn failure(&self) -> Option<TaskError> {
        match &self.slot {
            Some(Err(payload)) => Some(TaskError::from_panic(&**payload)),
            _ => None,
        }
    }

    /// Extract the outcome. Panics if the frame has not completed or the
    /// result was already taken.
    pub fn take_result(&mut self) -> Result<T, TaskError> {
        self.take_raw()
            .map_err(|payload| TaskError::from_panic(&*payload))
    }

    fn take_raw(&mut self) -> Result<T, Box<dyn Any + Send>> {
        match self.state {
            TaskState::Running => panic!("result of {} extracted before it completed", self.id),
            TaskState::Consumed => panic!("result of {} extracted twice", self.id),
            TaskState::Complete => {}
        }
        self.state = TaskState::Consumed;
        match self.slot.take() {
            Some(outcome) => outcome,
            None => unreachable!("complete task without a result slot"),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

/// Awaiting a task: a stored panic is re-raised here, at extraction.
impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if this.state == TaskState::Running && this.resume(cx).is_pending() {
            return Poll::Pending;
        }
        match this.take_raw() {
            Ok(value) => Poll::Ready(value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// Type-erased root frame, as stored in the executor's pending table.
pub(crate) trait Frame {
    fn id(&self) -> TaskId;
    fn resume(&mut self, cx: &mut Context<'_>) -> Poll<()>;
    fn failure(&self) -> Option<TaskError>;
}

impl<T: 'static> Frame for Task<T> {
    fn id(&self) -> TaskId {
        Task::id(self)
    }

    fn resume(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        Task::resume(self, cx)
    }

    fn failure(&self) -> Option<TaskError> {
        Task::failure(self)
    }
}
