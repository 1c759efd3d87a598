// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.

use std::thread;

/// Tunables for executors and the thread pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuntimeConfig {
    /// Number of worker threads in a `ThreadPool`. 0 means one per core.
    pub workers: usize,
    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name: String,
    /// Maximum readiness events collected per `epoll_wait` call.
    pub max_events: usize,
    /// Stack size for worker threads. `None` keeps the platform default.
    pub stack_size: Option<usize>,
}

impl RuntimeConfig {
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Clamped to at least one.
    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Worker count with the "0 = auto" rule applied.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            thread_name: "corio-worker".to_string(),
            max_events: 64,
            stack_size: None,
        }
    }
}
