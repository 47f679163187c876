// SPDX-License-Identifier: Apache-2.0

//! End-to-end task-set scenario: a concurrency-capped pipeline of sub-jobs
//! executed on a thread pool.

use corun::threading::{TaskDriver, TaskJob, ThreadPool};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

struct PipelineDriver {
    pool: ThreadPool,
    remaining: AtomicI32,
    active: AtomicI32,
    peak: AtomicI32,
    handled: AtomicI32,
    done: Mutex<Vec<i32>>,
}

#[derive(Clone)]
struct Handle(Arc<PipelineDriver>);

impl std::ops::Deref for Handle {
    type Target = PipelineDriver;

    fn deref(&self) -> &PipelineDriver {
        &self.0
    }
}

impl TaskDriver for Handle {
    type Job = i32;

    fn fetch(&self) -> Option<i32> {
        let left = self.remaining.fetch_sub(1, Ordering::SeqCst);
        (left > 0).then_some(left)
    }

    fn handle(&self, job: TaskJob<Self>) {
        let driver = self.clone();
        self.pool.submit(move || {
            let now = driver.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = driver.peak.fetch_max(now, Ordering::SeqCst);

            std::thread::sleep(Duration::from_millis(20));

            let _ = driver.active.fetch_sub(1, Ordering::SeqCst);
            let _ = driver.handled.fetch_add(1, Ordering::SeqCst);
            job.finish(0);
        });
    }

    fn done(&self, retcode: i32) {
        self.done.lock().push(retcode);
    }
}

#[test]
fn depth_caps_concurrent_sub_jobs() {
    let driver = Arc::new(PipelineDriver {
        pool: ThreadPool::new("itTask", 16, None).expect("pool"),
        remaining: AtomicI32::new(100),
        active: AtomicI32::new(0),
        peak: AtomicI32::new(0),
        handled: AtomicI32::new(0),
        done: Mutex::new(Vec::new()),
    });

    corun::threading::process(8, Handle(driver.clone()));

    let deadline = Instant::now() + Duration::from_secs(30);
    while driver.done.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(*driver.done.lock(), vec![0], "task settled exactly once");
    assert_eq!(driver.handled.load(Ordering::SeqCst), 100);
    assert!(
        driver.peak.load(Ordering::SeqCst) <= 8,
        "concurrency exceeded the depth cap: {}",
        driver.peak.load(Ordering::SeqCst)
    );
}
