// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fan-in wait over several channels.
//!
//! One waiter is bound to every source at once, so whichever source
//! changes first wakes the caller. `select` only reports readiness; the
//! caller then drains the sources with `try_pop`.

use std::sync::Arc;

use tracing::trace;

use crate::awaiter::suspend;
use crate::error::RuntimeError;
use crate::eventfd::{EventFdAwaiter, EventFdPool};
use crate::executor::Handle;
use crate::waiter::Waiter;

/// State of a source at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Holds data; no need to wait.
    Ready,
    /// Closed and drained; will never become ready.
    Closed,
    /// The waiter is now registered with the source.
    Waiting,
}

/// A source `select` can wait on.
pub trait Selectable {
    /// Register `waiter` unless the source is already ready or closed.
    fn bind(&self, waiter: &Arc<Waiter>) -> Readiness;

    /// Drop `waiter` from the source. If the waiter holds a wakeup it
    /// never used and the source has data, another waiter gets woken. The
    /// check has to happen under the source's own lock.
    fn unbind(&self, waiter: &Arc<Waiter>);

    /// Has data, or may still receive some.
    fn is_open(&self) -> bool;
}

/// Wait until any of `sources` has data or is closed.
///
/// Returns `true` at once if a source already holds data, `false` at once
/// if every source is closed and drained. Otherwise suspends once and
/// reports whether any source is still open afterwards. The wakeup may be
/// spurious for a given source; drain with `try_pop` and call again.
pub async fn select(handle: &Handle, sources: &[&dyn Selectable]) -> Result<bool, RuntimeError> {
    let waiter = Waiter::new(EventFdPool::global())?;
    let mut bound = Bound {
        sources: Vec::with_capacity(sources.len()),
        waiter: &waiter,
    };

    for &source in sources {
        match source.bind(&waiter) {
            Readiness::Ready => return Ok(true),
            Readiness::Closed => {}
            Readiness::Waiting => bound.sources.push(source),
        }
    }
    if bound.sources.is_empty() {
        return Ok(false);
    }

    let mut awaiter = EventFdAwaiter::new(handle, waiter.raw_fd());
    trace!(sources = bound.sources.len(), "select suspended");
    suspend(&mut awaiter).await?;
    waiter.take_notification();
    drop(awaiter);
    drop(bound);

    Ok(sources.iter().any(|s| s.is_open()))
}

/// Unbinds the shared waiter from every source it was registered with.
struct Bound<'a> {
    sources: Vec<&'a dyn Selectable>,
    waiter: &'a Arc<Waiter>,
}

impl Drop for Bound<'_> {
    fn drop(&mut self) {
        // The notification is only read, not taken, until every source has
        // let go: it may have come from any of them.
        for source in &self.sources {
            source.unbind(self.waiter);
        }
        self.waiter.take_notification();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, TryRecvError};
    use crate::config::RuntimeConfig;
    use crate::executor::Executor;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::thread;
    use std::time::Duration;

    fn executor() -> Executor {
        Executor::with_config(&RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn ready_source_returns_without_suspending() {
        let exec = executor();
        let a = Arc::new(Channel::<u8>::new());
        let b = Arc::new(Channel::<u8>::new());
        b.push(1).unwrap();
        let out = Rc::new(Cell::new(None));

        let (ca, cb, o) = (a.clone(), b.clone(), out.clone());
        exec.run_fn(move |h| async move {
            o.set(Some(select(&h, &[&*ca, &*cb]).await.unwrap()));
        });
        assert_eq!(out.get(), Some(true));
        assert_eq!(exec.pending_count(), 0);
    }

    #[test]
    fn all_closed_returns_false() {
        let exec = executor();
        let a = Arc::new(Channel::<u8>::new());
        let b = Arc::new(Channel::<u8>::new());
        a.close();
        b.close();
        let out = Rc::new(Cell::new(None));

        let (ca, cb, o) = (a.clone(), b.clone(), out.clone());
        exec.run_fn(move |h| async move {
            o.set(Some(select(&h, &[&*ca, &*cb]).await.unwrap()));
        });
        assert_eq!(out.get(), Some(false));
    }

    #[test]
    fn drains_two_producers_until_both_close() {
        let exec = executor();
        let a = Arc::new(Channel::new());
        let b = Arc::new(Channel::new());
        let got = Rc::new(RefCell::new(Vec::new()));

        let (ca, cb, g) = (a.clone(), b.clone(), got.clone());
        exec.run_fn(move |h| async move {
            while select(&h, &[&*ca, &*cb]).await.unwrap() {
                for chan in [&ca, &cb] {
                    loop {
                        match chan.try_pop() {
                            Ok(v) => g.borrow_mut().push(v),
                            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        let producers: Vec<_> = [(a.clone(), 0), (b.clone(), 100)]
            .into_iter()
            .map(|(chan, base)| {
                thread::spawn(move || {
                    for i in 0..3 {
                        thread::sleep(Duration::from_millis(3));
                        chan.push(base + i).unwrap();
                    }
                    chan.close();
                })
            })
            .collect();

        exec.run_until_idle().unwrap();
        for p in producers {
            p.join().unwrap();
        }

        let mut got = got.borrow().clone();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 100, 101, 102]);
        assert_eq!(exec.pending_count(), 0);
    }
}
