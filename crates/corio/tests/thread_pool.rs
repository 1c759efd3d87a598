// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! ThreadPool scenarios: round-robin distribution and orderly shutdown.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use corio::{sleep, RuntimeConfig, ThreadPool};

#[test]
fn twenty_closures_over_four_workers() {
    common::init_tracing();
    let pool = ThreadPool::new(4).unwrap();
    let ran_on: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let mut picked = [0usize; 4];

    for i in 0..20u64 {
        let ran_on = ran_on.clone();
        let idx = pool.add(move |h| async move {
            // Stagger completion so shutdown really has to wait.
            sleep(&h, Duration::from_millis(20 - i)).await.unwrap();
            let name = thread::current().name().unwrap_or("?").to_string();
            *ran_on.lock().entry(name).or_default() += 1;
        });
        picked[idx] += 1;
    }
    assert_eq!(picked, [5, 5, 5, 5]);

    pool.shutdown();

    let ran_on = ran_on.lock();
    assert_eq!(ran_on.values().sum::<usize>(), 20);
    assert_eq!(ran_on.len(), 4);
    for i in 0..4 {
        assert_eq!(ran_on.get(&format!("corio-worker-{i}")), Some(&5));
    }
}

#[test]
fn dropping_the_pool_waits_like_shutdown() {
    common::init_tracing();
    let done = Arc::new(Mutex::new(Vec::new()));
    {
        let pool = ThreadPool::with_config(RuntimeConfig::default().workers(2)).unwrap();
        for i in 0..4 {
            let done = done.clone();
            pool.add_task(async move {
                done.lock().push(i);
            });
        }
        let done = done.clone();
        pool.add(move |h| async move {
            sleep(&h, Duration::from_millis(10)).await.unwrap();
            done.lock().push(99);
        });
    }
    let mut done = done.lock().clone();
    done.sort();
    assert_eq!(done, vec![0, 1, 2, 3, 99]);
}

#[test]
fn job_added_while_a_batch_runs_survives_shutdown() {
    common::init_tracing();
    let pool = ThreadPool::new(1).unwrap();
    let ran = Arc::new(Mutex::new(0usize));

    let first = ran.clone();
    pool.add(move |_| async move {
        // Hold the worker inside the doorbell callback.
        thread::sleep(Duration::from_millis(50));
        *first.lock() += 1;
    });
    thread::sleep(Duration::from_millis(10));

    let second = ran.clone();
    let idx = pool.add(move |_| async move {
        *second.lock() += 1;
    });
    assert_eq!(idx, 0);

    pool.shutdown();
    assert_eq!(*ran.lock(), 2);
}
