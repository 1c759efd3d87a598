// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime and task errors.

use std::any::Any;
use std::io;

use thiserror::Error;

/// Failure surfaced by the runtime itself (as opposed to user code).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The reactor refused a readiness or timer registration.
    #[error("reactor registration failed: {0}")]
    Registration(#[source] io::Error),

    /// The reactor loop itself failed (epoll_wait, epoll_create, ...).
    #[error("reactor failure: {0}")]
    Reactor(#[source] io::Error),

    /// A notification handle could not be created.
    #[error("failed to create notification handle: {0}")]
    Notify(#[source] io::Error),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Why a task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The coroutine panicked; the message is extracted from the payload.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        TaskError::Panicked(msg)
    }
}
