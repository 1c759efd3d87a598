// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Waiter sets shared by the synchronization primitives.
//!
//! A [`Waiter`] is the notification target one parked coroutine listens
//! on. Primitives keep waiters in a [`WaiterSet`] under their own lock and
//! notify them from whatever thread changes the state.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::eventfd::{EventFdPool, PooledEventFd};

/// One parked coroutine's notification target: an eventfd plus a flag
/// that keeps a single wakeup from being delivered twice.
pub struct Waiter {
    fd: PooledEventFd,
    notified: AtomicBool,
}

impl Waiter {
    pub(crate) fn new(pool: &Arc<EventFdPool>) -> Result<Arc<Self>, RuntimeError> {
        Ok(Arc::new(Self {
            fd: pool.acquire()?,
            notified: AtomicBool::new(false),
        }))
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.raw_fd()
    }

    /// Signal the waiter. Returns `false` if it was already notified and
    /// has not consumed that notification yet.
    pub(crate) fn notify(&self) -> bool {
        if self.notified.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.fd.signal();
        true
    }

    /// Consume a pending notification.
    pub(crate) fn take_notification(&self) -> bool {
        self.notified.swap(false, Ordering::AcqRel)
    }

    /// Whether a notification is waiting to be consumed.
    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("fd", &self.raw_fd())
            .field("notified", &self.notified.load(Ordering::Acquire))
            .finish()
    }
}

/// Registered waiters in arrival order.
#[derive(Debug, Default)]
pub(crate) struct WaiterSet {
    waiters: VecDeque<Arc<Waiter>>,
}

impl WaiterSet {
    pub(crate) fn push(&mut self, waiter: &Arc<Waiter>) {
        if !self.contains(waiter) {
            self.waiters.push_back(waiter.clone());
        }
    }

    pub(crate) fn contains(&self, waiter: &Arc<Waiter>) -> bool {
        self.waiters.iter().any(|w| Arc::ptr_eq(w, waiter))
    }

    pub(crate) fn remove(&mut self, waiter: &Arc<Waiter>) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        self.waiters.len() != before
    }

    /// Wake the longest-registered waiter not already notified elsewhere.
    pub(crate) fn wake_one(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.notify() {
                return true;
            }
        }
        false
    }

    /// Take out a waiter that is giving up its wait.
    ///
    /// Must be called under the owning primitive's lock: every `notify`
    /// also happens under it, so the notified flag read here is final for
    /// this set. A notification the waiter never consumed is passed to the
    /// next waiter when `pending` says there is still something to claim.
    /// Returns whether a wakeup was forwarded.
    pub(crate) fn leave(&mut self, waiter: &Arc<Waiter>, pending: bool) -> bool {
        self.remove(waiter);
        if pending && waiter.is_notified() {
            return self.wake_one();
        }
        false
    }

    pub(crate) fn wake_all(&mut self) -> usize {
        self.waiters.drain(..).filter(|w| w.notify()).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
