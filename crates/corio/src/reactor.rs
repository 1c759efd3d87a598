// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor contract and the bundled epoll implementation.
//!
//! The runtime only talks to the event loop through [`Reactor`]: register a
//! descriptor or a timer with a one-shot callback, deregister, run, stop.
//! Every registration fires at most once and is removed before its
//! callback runs, so callbacks are free to register again.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::trace;

/// One-shot action run by the reactor on its own thread.
pub type Callback = Box<dyn FnOnce() + 'static>;

/// Token identifying a live registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Registration(u64);

impl Registration {
    pub fn token(self) -> u64 {
        self.0
    }
}

/// Event-loop collaborator. One instance per thread; not `Send`.
pub trait Reactor {
    /// Call `callback` once when `fd` becomes readable.
    fn register_readiness(&self, fd: RawFd, callback: Callback) -> io::Result<Registration>;

    /// Call `callback` once after `after` has elapsed.
    fn register_timer(&self, after: Duration, callback: Callback) -> io::Result<Registration>;

    /// Drop a registration without firing it. Unknown or already fired
    /// registrations are ignored.
    fn deregister(&self, registration: Registration);

    /// Dispatch callbacks until [`Reactor::stop`] is called or nothing is
    /// registered any more.
    fn run(&self) -> io::Result<()>;

    /// Ask a running loop to return after the current dispatch batch.
    fn stop(&self);
}

enum Watch {
    Readable { fd: RawFd, callback: Callback },
    Timer { deadline: Instant, callback: Callback },
}

#[derive(Default)]
struct State {
    next_token: u64,
    watches: HashMap<u64, Watch>,
    /// Armed timers ordered by deadline; the token breaks ties.
    timers: BTreeSet<(Instant, u64)>,
}

impl State {
    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Level-triggered epoll reactor with an in-process timer set.
///
/// Timers never touch the kernel: the nearest deadline becomes the
/// `epoll_wait` timeout.
pub struct EpollReactor {
    epoll_fd: RawFd,
    max_events: usize,
    state: RefCell<State>,
    stopped: Cell<bool>,
}

impl EpollReactor {
    /// Reactor with the default batch of 64 events per wait.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(64)
    }

    /// Create a reactor that collects up to `max_events` events per wait.
    pub fn with_capacity(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            max_events: max_events.max(1),
            state: RefCell::new(State::default()),
            stopped: Cell::new(false),
        })
    }

    /// Number of live registrations (descriptors and timers).
    pub fn registered(&self) -> usize {
        self.state.borrow().watches.len()
    }

    /// Milliseconds until the nearest timer, -1 when none is armed.
    fn wait_timeout(&self) -> i32 {
        let state = self.state.borrow();
        match state.timers.iter().next() {
            Some(&(deadline, _)) => {
                let left = deadline.saturating_duration_since(Instant::now());
                // Round up so a timer is never polled a hair too early.
                let ms = (left.as_nanos() + 999_999) / 1_000_000;
                ms.min(i32::MAX as u128) as i32
            }
            None => -1,
        }
    }

    fn epoll_del(&self, fd: RawFd) {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the FD was already closed.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                trace!(fd, error = %err, "epoll deregistration failed");
            }
        }
    }

    /// Pull fired watches out of the table. Callbacks are returned, not
    /// run, so they may re-enter the reactor.
    fn collect(&self, events: &[libc::epoll_event]) -> Vec<Callback> {
        let mut fired = Vec::new();
        let mut state = self.state.borrow_mut();

        for ev in events {
            let token = ev.u64;
            match state.watches.remove(&token) {
                Some(Watch::Readable { fd, callback }) => {
                    self.epoll_del(fd);
                    fired.push(callback);
                }
                Some(timer @ Watch::Timer { .. }) => {
                    // Tokens are unique; a timer can't be reported by epoll.
                    state.watches.insert(token, timer);
                }
                None => {}
            }
        }

        let now = Instant::now();
        while let Some(&(deadline, token)) = state.timers.iter().next() {
            if deadline > now {
                break;
            }
            state.timers.remove(&(deadline, token));
            if let Some(Watch::Timer { callback, .. }) = state.watches.remove(&token) {
                fired.push(callback);
            }
        }

        fired
    }
}

impl Reactor for EpollReactor {
    fn register_readiness(&self, fd: RawFd, callback: Callback) -> io::Result<Registration> {
        let mut state = self.state.borrow_mut();
        let token = state.next_token();

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        state.watches.insert(token, Watch::Readable { fd, callback });
        trace!(fd, token, "registered readiness watch");
        Ok(Registration(token))
    }

    fn register_timer(&self, after: Duration, callback: Callback) -> io::Result<Registration> {
        let deadline = Instant::now()
            .checked_add(after)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "timer overflows Instant"))?;

        let mut state = self.state.borrow_mut();
        let token = state.next_token();
        state.timers.insert((deadline, token));
        state.watches.insert(token, Watch::Timer { deadline, callback });
        trace!(token, ?after, "registered timer");
        Ok(Registration(token))
    }

    fn deregister(&self, registration: Registration) {
        // Take the watch out first; its callback is dropped after the
        // borrow ends in case dropping it re-enters the reactor.
        let removed = {
            let mut state = self.state.borrow_mut();
            let removed = state.watches.remove(&registration.0);
            if let Some(Watch::Timer { deadline, .. }) = &removed {
                state.timers.remove(&(*deadline, registration.0));
            }
            removed
        };
        if let Some(Watch::Readable { fd, .. }) = &removed {
            self.epoll_del(*fd);
        }
        drop(removed);
    }

    fn run(&self) -> io::Result<()> {
        self.stopped.set(false);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        while !self.stopped.get() {
            if self.state.borrow().watches.is_empty() {
                // Nothing can ever fire again.
                break;
            }

            let timeout = self.wait_timeout();
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for callback in self.collect(&events[..n as usize]) {
                callback();
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stopped.set(true);
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        let watches = std::mem::take(&mut self.state.get_mut().watches);
        for watch in watches.values() {
            if let Watch::Readable { fd, .. } = watch {
                self.epoll_del(*fd);
            }
        }
        drop(watches);
        unsafe { libc::close(self.epoll_fd) };
    }
}
