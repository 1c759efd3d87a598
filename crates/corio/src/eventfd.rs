// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Notification handles.
//!
//! An [`EventFd`] becomes readable once signaled, from any thread, and is
//! the only way a primitive wakes a coroutine parked on another thread's
//! reactor. Handles are recycled through an [`EventFdPool`] so wait loops
//! don't grow the descriptor table.

use std::cell::Cell;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::trace;

use crate::awaiter::{Awaiter, Resume};
use crate::error::RuntimeError;
use crate::executor::Handle;
use crate::reactor::Registration;

/// Owned, non-blocking Linux eventfd.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create a non-blocking, close-on-exec eventfd with a zero counter.
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// The descriptor to hand to a reactor. Owned by `self`.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Make the descriptor readable. Safe to call from any thread.
    pub fn signal(&self) {
        let one: u64 = 1;
        // EAGAIN only happens when the counter is saturated, which still
        // leaves the descriptor readable.
        unsafe { libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8) };
    }

    /// Reset the counter. Returns whether the handle had been signaled.
    pub fn drain(&self) -> bool {
        drain_fd(self.fd)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn drain_fd(fd: RawFd) -> bool {
    let mut buf: u64 = 0;
    let n = unsafe { libc::read(fd, &mut buf as *mut u64 as *mut libc::c_void, 8) };
    n == 8
}

/// Thread-safe recycling allocator for [`EventFd`]s.
#[derive(Debug, Default)]
pub struct EventFdPool {
    free: Mutex<Vec<EventFd>>,
}

impl EventFdPool {
    /// An empty pool; handles are created on first demand.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Process-wide pool used by primitives created without an explicit one.
    pub fn global() -> &'static Arc<EventFdPool> {
        static GLOBAL: OnceLock<Arc<EventFdPool>> = OnceLock::new();
        GLOBAL.get_or_init(EventFdPool::new)
    }

    /// Hand out an idle handle, creating one if the pool is empty.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledEventFd, RuntimeError> {
        let recycled = self.free.lock().pop();
        let fd = match recycled {
            Some(fd) => fd,
            None => {
                let fd = EventFd::new().map_err(RuntimeError::Notify)?;
                trace!(fd = fd.raw_fd(), "allocated notification handle");
                fd
            }
        };
        Ok(PooledEventFd {
            fd: Some(fd),
            pool: self.clone(),
        })
    }

    /// Handles currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// An [`EventFd`] on loan from a pool; drained and returned on drop.
#[derive(Debug)]
pub struct PooledEventFd {
    fd: Option<EventFd>,
    pool: Arc<EventFdPool>,
}

impl Deref for PooledEventFd {
    type Target = EventFd;

    fn deref(&self) -> &EventFd {
        match &self.fd {
            Some(fd) => fd,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl Drop for PooledEventFd {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            fd.drain();
            self.pool.free.lock().push(fd);
        }
    }
}

/// Suspends until a descriptor becomes readable, then drains it.
///
/// Reusable: each suspension arms a fresh one-shot watch, dropping any
/// watch left over from an earlier iteration first.
pub struct EventFdAwaiter {
    handle: Handle,
    fd: RawFd,
    armed: Rc<Cell<Option<Registration>>>,
}

impl EventFdAwaiter {
    /// `fd` must stay open for as long as the awaiter lives.
    pub fn new(handle: &Handle, fd: RawFd) -> Self {
        Self {
            handle: handle.clone(),
            fd,
            armed: Rc::new(Cell::new(None)),
        }
    }

    /// Whether a watch from the last suspension is still registered.
    pub fn is_armed(&self) -> bool {
        self.armed.get().is_some()
    }

    fn disarm(&self) {
        if let Some(reg) = self.armed.take() {
            self.handle.deregister(reg);
        }
    }
}

impl Awaiter for EventFdAwaiter {
    type Output = ();

    fn on_suspend(&mut self, resume: Resume) -> Result<(), RuntimeError> {
        self.disarm();
        let armed = self.armed.clone();
        let fd = self.fd;
        let reg = self.handle.register_readiness(fd, move || {
            armed.set(None);
            drain_fd(fd);
            resume.resume();
        })?;
        self.armed.set(Some(reg));
        Ok(())
    }

    fn result(&mut self) {}
}

impl Drop for EventFdAwaiter {
    fn drop(&mut self) {
        self.disarm();
    }
}
