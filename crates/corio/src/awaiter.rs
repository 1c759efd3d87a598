// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The awaiter protocol every suspension point implements.
//!
//! An [`Awaiter`] answers three questions: is the result already there
//! (`ready`), how will I be resumed (`on_suspend`), and what did I
//! produce (`result`). [`suspend`] adapts an awaiter into a future.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::RuntimeError;

/// One suspension point.
pub trait Awaiter {
    type Output;

    /// `true` skips suspension entirely.
    fn ready(&mut self) -> bool {
        false
    }

    /// Store `resume` and perform the single side effect that guarantees it
    /// will eventually run. Must not block.
    fn on_suspend(&mut self, resume: Resume) -> Result<(), RuntimeError>;

    /// Extract the produced value. Only called after `ready` returned true
    /// or the stored [`Resume`] fired.
    fn result(&mut self) -> Self::Output;
}

/// Reusing one awaiter across the iterations of a wait loop.
impl<A: Awaiter + ?Sized> Awaiter for &mut A {
    type Output = A::Output;

    fn ready(&mut self) -> bool {
        (**self).ready()
    }

    fn on_suspend(&mut self, resume: Resume) -> Result<(), RuntimeError> {
        (**self).on_suspend(resume)
    }

    fn result(&mut self) -> Self::Output {
        (**self).result()
    }
}

struct Signal {
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// The action that re-enters a suspended frame.
///
/// Consumed by [`Resume::resume`], so one suspension is resumed at most once.
pub struct Resume {
    signal: Arc<Signal>,
}

impl Resume {
    /// Wake the suspended frame. May be called from any thread; the frame
    /// itself always resumes on its executor's thread.
    pub fn resume(self) {
        self.signal.fired.store(true, Ordering::Release);
        let waker = self.signal.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for Resume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resume")
            .field("fired", &self.signal.fired.load(Ordering::Acquire))
            .finish()
    }
}

enum State {
    Idle,
    Suspended(Arc<Signal>),
    Done,
}

/// Future driving one [`Awaiter`] through ready / suspend / result.
#[must_use = "futures do nothing unless awaited"]
pub struct Suspend<A> {
    awaiter: A,
    state: State,
}

/// Turn an awaiter into a future.
pub fn suspend<A: Awaiter>(awaiter: A) -> Suspend<A> {
    Suspend {
        awaiter,
        state: State::Idle,
    }
}

impl<A: Awaiter + Unpin> Future for Suspend<A> {
    type Output = Result<A::Output, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            State::Idle => {
                if this.awaiter.ready() {
                    this.state = State::Done;
                    return Poll::Ready(Ok(this.awaiter.result()));
                }
                let signal = Arc::new(Signal {
                    fired: AtomicBool::new(false),
                    waker: Mutex::new(Some(cx.waker().clone())),
                });
                let resume = Resume {
                    signal: signal.clone(),
                };
                if let Err(err) = this.awaiter.on_suspend(resume) {
                    this.state = State::Done;
                    return Poll::Ready(Err(err));
                }
                this.state = State::Suspended(signal);
                Poll::Pending
            }
            State::Suspended(signal) => {
                if signal.fired.load(Ordering::Acquire) {
                    this.state = State::Done;
                    return Poll::Ready(Ok(this.awaiter.result()));
                }
                // Polled by someone other than our Resume; keep waiting.
                *signal.waker.lock() = Some(cx.waker().clone());
                if signal.fired.load(Ordering::Acquire) {
                    this.state = State::Done;
                    return Poll::Ready(Ok(this.awaiter.result()));
                }
                Poll::Pending
            }
            State::Done => panic!("awaiter polled after it produced its result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands its Resume to the test.
    struct Parked {
        slot: Arc<Mutex<Option<Resume>>>,
        ready: bool,
    }

    impl Awaiter for Parked {
        type Output = u32;

        fn ready(&mut self) -> bool {
            self.ready
        }

        fn on_suspend(&mut self, resume: Resume) -> Result<(), RuntimeError> {
            *self.slot.lock() = Some(resume);
            Ok(())
        }

        fn result(&mut self) -> u32 {
            7
        }
    }

    struct Refusing;

    impl Awaiter for Refusing {
        type Output = ();

        fn on_suspend(&mut self, _resume: Resume) -> Result<(), RuntimeError> {
            Err(RuntimeError::Registration(std::io::Error::from_raw_os_error(
                libc::ENOMEM,
            )))
        }

        fn result(&mut self) {}
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F, waker: &Arc<CountingWaker>) -> Poll<F::Output> {
        let waker = Waker::from(waker.clone());
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn ready_awaiter_skips_suspension() {
        let slot = Arc::new(Mutex::new(None));
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut fut = suspend(Parked {
            slot: slot.clone(),
            ready: true,
        });
        assert!(matches!(poll_once(&mut fut, &waker), Poll::Ready(Ok(7))));
        assert!(slot.lock().is_none());
    }

    #[test]
    fn spurious_poll_stays_pending_until_resumed() {
        let slot = Arc::new(Mutex::new(None));
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut fut = suspend(Parked {
            slot: slot.clone(),
            ready: false,
        });

        assert!(poll_once(&mut fut, &waker).is_pending());
        assert!(poll_once(&mut fut, &waker).is_pending());

        slot.lock().take().unwrap().resume();
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
        assert!(matches!(poll_once(&mut fut, &waker), Poll::Ready(Ok(7))));
    }

    #[test]
    fn registration_failure_is_the_result() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut fut = suspend(Refusing);
        assert!(matches!(
            poll_once(&mut fut, &waker),
            Poll::Ready(Err(RuntimeError::Registration(_)))
        ));
    }

    #[test]
    #[should_panic(expected = "polled after")]
    fn polling_after_completion_panics() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let mut fut = suspend(Parked {
            slot: Arc::new(Mutex::new(None)),
            ready: true,
        });
        let _ = poll_once(&mut fut, &waker);
        let _ = poll_once(&mut fut, &waker);
    }
}
