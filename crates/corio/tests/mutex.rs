// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Mutex scenarios: exclusive critical sections under interleaving.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corio::{sleep, Mutex, ThreadPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Enter(u8),
    Exit(u8),
}

#[test]
fn two_coroutines_never_overlap_in_the_critical_section() {
    let exec = common::executor();
    let mutex = Arc::new(Mutex::new(()));
    let log = Rc::new(RefCell::new(Vec::new()));

    for who in [1u8, 2] {
        let (m, l) = (mutex.clone(), log.clone());
        exec.run_fn(move |h| async move {
            for _ in 0..10 {
                sleep(&h, Duration::from_millis(1)).await.unwrap();
                let guard = m.lock(&h).await.unwrap();
                l.borrow_mut().push(Event::Enter(who));
                // Yield inside the section so the other side gets a turn
                // to try the lock.
                sleep(&h, Duration::from_millis(1)).await.unwrap();
                l.borrow_mut().push(Event::Exit(who));
                drop(guard);
            }
        });
    }

    exec.run_until_idle().unwrap();
    assert!(!mutex.is_locked());

    let log = log.borrow();
    assert_eq!(log.len(), 40);
    for pair in log.chunks(2) {
        match pair {
            [Event::Enter(a), Event::Exit(b)] => assert_eq!(a, b, "sections overlapped: {log:?}"),
            other => panic!("sections overlapped: {other:?} in {log:?}"),
        }
    }
}

#[test]
fn release_hands_the_lock_to_exactly_one_waiter() {
    let exec = common::executor();
    let mutex = Arc::new(Mutex::new(0u32));
    let holders = Rc::new(RefCell::new(0usize));
    let peak = Rc::new(RefCell::new(0usize));

    let m = mutex.clone();
    exec.run_fn(move |h| async move {
        let _g = m.lock(&h).await.unwrap();
        sleep(&h, Duration::from_millis(5)).await.unwrap();
    });

    for _ in 0..5 {
        let (m, hs, pk) = (mutex.clone(), holders.clone(), peak.clone());
        exec.run_fn(move |h| async move {
            let mut g = m.lock(&h).await.unwrap();
            *hs.borrow_mut() += 1;
            let now = *hs.borrow();
            let mut p = pk.borrow_mut();
            *p = (*p).max(now);
            drop(p);
            *g += 1;
            sleep(&h, Duration::from_millis(1)).await.unwrap();
            *hs.borrow_mut() -= 1;
        });
    }

    exec.run_until_idle().unwrap();
    assert_eq!(*peak.borrow(), 1);
    assert_eq!(*mutex.try_lock().unwrap(), 5);
}

#[test]
fn explicit_unlock_releases_before_scope_end() {
    let exec = common::executor();
    let mutex = Arc::new(Mutex::new(Vec::new()));

    let m = mutex.clone();
    exec.run_fn(move |h| async move {
        let mut g = m.lock(&h).await.unwrap();
        g.push("first");
        g.unlock();
        assert!(!m.is_locked());
        let mut again = m.lock(&h).await.unwrap();
        again.push("second");
    });

    assert_eq!(exec.pending_count(), 0);
    assert_eq!(*mutex.try_lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn pool_workers_contend_on_one_mutex() {
    common::init_tracing();
    let pool = ThreadPool::new(4).unwrap();
    let mutex = Arc::new(Mutex::new(0u64));
    let inside = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let (m, inside) = (mutex.clone(), inside.clone());
        pool.add(move |h| async move {
            for _ in 0..10 {
                let mut g = m.lock(&h).await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                *g += 1;
                sleep(&h, Duration::from_micros(100)).await.unwrap();
                inside.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }
    pool.shutdown();

    assert_eq!(*mutex.try_lock().unwrap(), 80);
}
