// SPDX-License-Identifier: Apache-2.0

//! End-to-end scheduler scenarios: sleep ordering and semaphore
//! rendezvous across workers.

use corun::coroutine::{CoSem, CoroutineManager, sleep_ms};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn sleepers_on_one_worker_wake_by_deadline() {
    let mgr = CoroutineManager::new("itSleep", 16, 2).expect("manager");
    let wakes = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    // All three tasks pinned to worker 0; sleeps expire b, c, a.
    for (tag, ms) in [("a", 90u32), ("b", 30), ("c", 60)] {
        let wakes = wakes.clone();
        mgr.spawn_on(0, async move {
            sleep_ms(ms).await;
            wakes.lock().push((tag, start.elapsed()));
        })
        .expect("spawn");
    }

    assert!(wait_until(3_000, || wakes.lock().len() == 3));

    let seen = wakes.lock();
    let order: Vec<&str> = seen.iter().map(|(t, _)| *t).collect();
    assert_eq!(order, vec!["b", "c", "a"]);

    // Deadlines are approximate but must be respected from below.
    for (tag, elapsed) in seen.iter() {
        let requested = match *tag {
            "a" => 90,
            "b" => 30,
            _ => 60,
        };
        assert!(
            elapsed.as_millis() as u64 + 5 >= requested,
            "{tag} woke after {elapsed:?}, requested {requested} ms"
        );
    }
}

#[test]
fn cosem_rendezvous_between_two_tasks() {
    let mgr = CoroutineManager::new("itSem", 16, 2).expect("manager");
    let (tx, rx) = std::sync::mpsc::channel::<CoSem>();
    let settled = Arc::new(Mutex::new(None));

    let seen = settled.clone();
    mgr.spawn(async move {
        let sem = CoSem::new().expect("bound to this task");
        tx.send(sem.clone()).expect("handoff");

        let outcome = sem.down().await;
        let closed = sem.close().is_ok();
        *seen.lock() = Some((outcome.is_ok(), closed));
    })
    .expect("spawn waiter");

    let sem = rx.recv_timeout(Duration::from_secs(2)).expect("semaphore");
    mgr.spawn(async move {
        sleep_ms(5).await;
        sem.up();
    })
    .expect("spawn releaser");

    assert!(wait_until(2_000, || settled.lock().is_some()));
    assert_eq!(*settled.lock(), Some((true, true)));
}

#[test]
fn many_tasks_share_a_few_workers() {
    let mgr = CoroutineManager::new("itMany", 256, 3).expect("manager");
    let done = Arc::new(Mutex::new(0u32));

    for _ in 0..200 {
        let done = done.clone();
        mgr.spawn(async move {
            sleep_ms(3).await;
            corun::coroutine::yield_now().await;
            *done.lock() += 1;
        })
        .expect("spawn");
    }

    assert!(wait_until(5_000, || *done.lock() == 200));
}
