// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async mutual exclusion.
//!
//! `lock` suspends the calling coroutine instead of blocking its thread.
//! The critical section is the lifetime of the returned [`MutexGuard`];
//! dropping it releases the lock and wakes the longest waiter. There is
//! no reentrancy: locking twice from one coroutine without releasing
//! never completes.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex as StateLock;
use tracing::trace;

use crate::awaiter::suspend;
use crate::error::RuntimeError;
use crate::eventfd::{EventFdAwaiter, EventFdPool};
use crate::executor::Handle;
use crate::waiter::{Waiter, WaiterSet};

struct LockState {
    locked: bool,
    waiters: WaiterSet,
}

/// Async mutex guarding a `T`. `Mutex<()>` is a bare lock.
pub struct Mutex<T: ?Sized> {
    state: StateLock<LockState>,
    pool: Arc<EventFdPool>,
    value: UnsafeCell<T>,
}

// Safety: `value` is only reached through a guard, and at most one guard
// exists at a time.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Unlocked mutex around `value`, waiting through the process-wide
    /// handle pool.
    pub fn new(value: T) -> Self {
        Self::with_pool(value, EventFdPool::global().clone())
    }

    /// Mutex whose waiters draw notification handles from `pool`.
    pub fn with_pool(value: T, pool: Arc<EventFdPool>) -> Self {
        Self {
            state: StateLock::new(LockState {
                locked: false,
                waiters: WaiterSet::default(),
            }),
            pool,
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the mutex and return the protected value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, suspending while another coroutine holds it.
    pub async fn lock(&self, handle: &Handle) -> Result<MutexGuard<'_, T>, RuntimeError> {
        if let Some(guard) = self.try_lock() {
            return Ok(guard);
        }

        let waiter = Waiter::new(&self.pool)?;
        let _queued = Queued {
            state: &self.state,
            waiter: &waiter,
        };
        let mut awaiter = EventFdAwaiter::new(handle, waiter.raw_fd());

        loop {
            {
                let mut state = self.state.lock();
                if !state.locked {
                    state.locked = true;
                    return Ok(MutexGuard::new(self));
                }
                state.waiters.push(&waiter);
            }
            suspend(&mut awaiter).await?;
            waiter.take_notification();
        }
    }

    /// Acquire the lock only if it is free right now. Never suspends; a
    /// woken waiter that loses the race simply queues again.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(MutexGuard::new(self))
    }

    /// Whether some guard is alive. Only a snapshot when other threads
    /// share the mutex.
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// No guard can exist while `self` is mutably borrowed.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        let woke = state.waiters.wake_one();
        trace!(woke, "mutex released");
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("locked", &state.locked)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

/// Leaves the waiter queue when `lock` returns or is dropped mid-wait.
struct Queued<'a> {
    state: &'a StateLock<LockState>,
    waiter: &'a Arc<Waiter>,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        // Handed a free lock and never took it.
        let free = !state.locked;
        if state.waiters.leave(self.waiter, free) {
            trace!("unused lock handoff passed on");
        }
    }
}

/// Scope-bound critical section. Move-only; releases on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _marker: PhantomData,
        }
    }

    /// Release before the end of the scope.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
