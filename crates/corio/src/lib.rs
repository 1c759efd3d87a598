// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! corio: coroutine runtime with one reactor per thread.
//!
//! Coroutines are ordinary `async` code. An [`Executor`] starts root
//! frames, keeps them alive while suspended, and resumes them from a
//! trampoline whenever its [`Reactor`] fires a watch. Primitives built on
//! the [`Awaiter`] protocol and eventfd notifications let coroutines on
//! different threads talk to each other.
//!
//! Components:
//! - awaiter: ready / suspend / result protocol
//! - task: coroutine frames and their result slots
//! - executor: pending table, ready queue, trampoline
//! - reactor: event-loop contract plus an epoll implementation
//! - eventfd, timer: the two leaf awaiters
//! - channel, select, mutex: synchronization
//! - thread_pool: N executors on N threads

pub mod awaiter;
pub mod channel;
pub mod config;
pub mod error;
pub mod eventfd;
pub mod executor;
pub mod mutex;
pub mod reactor;
pub mod select;
pub mod task;
pub mod thread_pool;
pub mod timer;
pub mod waiter;

pub use awaiter::{suspend, Awaiter, Resume, Suspend};
pub use channel::{Channel, RecvError, SendError, TryRecvError};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, TaskError};
pub use eventfd::{EventFd, EventFdAwaiter, EventFdPool, PooledEventFd};
pub use executor::{Executor, Handle};
pub use mutex::{Mutex, MutexGuard};
pub use reactor::{EpollReactor, Reactor, Registration};
pub use select::{select, Readiness, Selectable};
pub use task::{Task, TaskId, TaskState};
pub use thread_pool::ThreadPool;
pub use timer::{sleep, SleepAwaiter};
