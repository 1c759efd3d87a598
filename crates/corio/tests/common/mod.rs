// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared setup for the integration scenarios.
#![allow(dead_code)]

use corio::{Executor, RuntimeConfig};

/// Route runtime logs to the test output; `RUST_LOG=corio=trace` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn executor() -> Executor {
    init_tracing();
    Executor::with_config(&RuntimeConfig::default()).expect("epoll reactor")
}
