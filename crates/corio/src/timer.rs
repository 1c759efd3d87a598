// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer awaiter.

use std::time::Duration;

use crate::awaiter::{suspend, Awaiter, Resume, Suspend};
use crate::error::RuntimeError;
use crate::executor::Handle;
use crate::reactor::Registration;

/// Resumes the awaiting frame once `after` has elapsed on the reactor.
///
/// A zero duration still suspends; the frame resumes on the next reactor
/// turn.
pub struct SleepAwaiter {
    handle: Handle,
    after: Duration,
    registration: Option<Registration>,
}

impl SleepAwaiter {
    /// Usually built through [`sleep`].
    pub fn new(handle: &Handle, after: Duration) -> Self {
        Self {
            handle: handle.clone(),
            after,
            registration: None,
        }
    }
}

impl Awaiter for SleepAwaiter {
    type Output = ();

    fn on_suspend(&mut self, resume: Resume) -> Result<(), RuntimeError> {
        let reg = self.handle.register_timer(self.after, move || resume.resume())?;
        self.registration = Some(reg);
        Ok(())
    }

    fn result(&mut self) {
        // Fired timers are gone from the reactor already.
        self.registration = None;
    }
}

impl Drop for SleepAwaiter {
    fn drop(&mut self) {
        if let Some(reg) = self.registration.take() {
            self.handle.deregister(reg);
        }
    }
}

/// Suspend the current coroutine for `after`.
pub fn sleep(handle: &Handle, after: Duration) -> Suspend<SleepAwaiter> {
    suspend(SleepAwaiter::new(handle, after))
}
