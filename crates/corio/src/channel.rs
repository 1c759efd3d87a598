// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Unbounded FIFO channel with close semantics.
//!
//! Producers may live on any thread; consumers await on their own
//! executor. Queue, closed flag and waiter set sit under one lock, so a
//! value pushed before `close` is always seen by a later `pop`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::awaiter::suspend;
use crate::error::RuntimeError;
use crate::eventfd::{EventFdAwaiter, EventFdPool};
use crate::executor::Handle;
use crate::select::{Readiness, Selectable};
use crate::waiter::{Waiter, WaiterSet};

/// The value handed back by `push` on a closed channel.
#[derive(PartialEq, Eq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed channel")
    }
}

impl<T> std::error::Error for SendError<T> {}

#[derive(Debug)]
pub enum RecvError {
    /// Closed and drained.
    Closed,
    /// Waiting for a value failed.
    Wait(RuntimeError),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Closed => write!(f, "receiving on a closed channel"),
            RecvError::Wait(err) => write!(f, "waiting on channel failed: {}", err),
        }
    }
}

impl std::error::Error for RecvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecvError::Closed => None,
            RecvError::Wait(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No value available right now.
    Empty,
    /// Closed and drained.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "channel is empty"),
            TryRecvError::Closed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for TryRecvError {}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    waiters: WaiterSet,
}

/// Async FIFO of `T`. Share it behind an `Arc` across threads.
pub struct Channel<T> {
    state: Mutex<State<T>>,
    pool: Arc<EventFdPool>,
}

impl<T> Channel<T> {
    /// Open, empty channel using the process-wide handle pool.
    pub fn new() -> Self {
        Self::with_pool(EventFdPool::global().clone())
    }

    /// Channel drawing its notification handles from `pool`.
    pub fn with_pool(pool: Arc<EventFdPool>) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
                waiters: WaiterSet::default(),
            }),
            pool,
        }
    }

    /// Append a value and wake one waiting consumer.
    pub fn push(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SendError(value));
        }
        state.queue.push_back(value);
        let woke = state.waiters.wake_one();
        trace!(len = state.queue.len(), woke, "value pushed");
        Ok(())
    }

    /// Take the next value, suspending until one arrives or the channel
    /// is closed and drained.
    pub async fn pop(&self, handle: &Handle) -> Result<T, RecvError> {
        match self.try_pop() {
            Ok(value) => return Ok(value),
            Err(TryRecvError::Closed) => return Err(RecvError::Closed),
            Err(TryRecvError::Empty) => {}
        }

        let waiter = Waiter::new(&self.pool).map_err(RecvError::Wait)?;
        let _parked = Parked {
            channel: self,
            waiter: &waiter,
        };
        let mut awaiter = EventFdAwaiter::new(handle, waiter.raw_fd());

        loop {
            {
                let mut state = self.state.lock();
                if let Some(value) = state.queue.pop_front() {
                    return Ok(value);
                }
                if state.closed {
                    return Err(RecvError::Closed);
                }
                state.waiters.push(&waiter);
            }
            suspend(&mut awaiter).await.map_err(RecvError::Wait)?;
            // Woken either by a push or by close; the loop re-checks which.
            waiter.take_notification();
        }
    }

    /// Take the next value without waiting. Distinguishes an empty open
    /// channel from one that is closed and drained.
    pub fn try_pop(&self) -> Result<T, TryRecvError> {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(value) => Ok(value),
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Close the channel and wake every waiting consumer. Returns `false`
    /// if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        let woken = state.waiters.wake_all();
        debug!(woken, remaining = state.queue.len(), "channel closed");
        true
    }

    /// Whether `close` has been called. Values may still be queued.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Values queued right now.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when nothing is queued right now.
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl<T> Selectable for Channel<T> {
    fn bind(&self, waiter: &Arc<Waiter>) -> Readiness {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            Readiness::Ready
        } else if state.closed {
            Readiness::Closed
        } else {
            state.waiters.push(waiter);
            Readiness::Waiting
        }
    }

    fn unbind(&self, waiter: &Arc<Waiter>) {
        let mut state = self.state.lock();
        let pending = !state.queue.is_empty();
        if state.waiters.leave(waiter, pending) {
            trace!("unused wakeup passed on");
        }
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        !state.queue.is_empty() || !state.closed
    }
}

/// Leaves the waiter set when a `pop` finishes or is dropped mid-wait.
/// A wakeup that was delivered but never consumed goes to the next waiter.
struct Parked<'a, T> {
    channel: &'a Channel<T>,
    waiter: &'a Arc<Waiter>,
}

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        self.channel.unbind(self.waiter);
    }
}
