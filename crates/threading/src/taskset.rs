// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency orchestration of sub-jobs derived from one task.
//!
//! [`process`] fans a task out into sub-jobs pulled from a [`TaskDriver`],
//! keeping at most `depth` of them outstanding. Completed jobs hand their
//! slot to freshly fetched ones; the first failure latches the task's
//! return code and stops further fetching while in-flight jobs drain
//! naturally. The driver's `done` hook fires exactly once.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

const MIN_DEPTH: u32 = 4;
const MAX_DEPTH: u32 = 128;

/// Supplier and consumer of sub-jobs for one task.
pub trait TaskDriver: Send + Sync + 'static {
    /// One unit of sub-work.
    type Job: Send + 'static;

    /// Produce the next sub-job, or `None` when the task is exhausted.
    fn fetch(&self) -> Option<Self::Job>;

    /// Dispatch a sub-job. The driver (or whatever it hands the job to)
    /// must eventually call [`TaskJob::finish`].
    fn handle(&self, job: TaskJob<Self>)
    where
        Self: Sized;

    /// Reclaim per-job resources after completion.
    fn release(&self, _job: &mut Self::Job) {}

    /// Called exactly once when the whole task settles; `retcode` is zero
    /// iff every fetched job reported success.
    fn done(&self, retcode: i32);
}

enum JobState {
    Done,
    Fail(i32),
}

struct Ready<J> {
    job: J,
    state: Option<JobState>,
}

struct SetState<J> {
    run: bool,
    no_jobs: bool,
    ready: VecDeque<Ready<J>>,
}

struct SetInner<D: TaskDriver> {
    driver: D,
    state: Mutex<SetState<D::Job>>,
    retcode: AtomicI32,
    cur_depth: AtomicU32,
    refs: AtomicI32,
    done: AtomicBool,
}

/// An in-flight sub-job. Call [`TaskJob::finish`] when the work settles;
/// dropping the value without finishing counts as a failure.
pub struct TaskJob<D: TaskDriver> {
    payload: Option<D::Job>,
    set: Option<Arc<SetInner<D>>>,
}

impl<D: TaskDriver> TaskJob<D> {
    /// Access the job payload.
    pub fn get(&self) -> &D::Job {
        self.payload.as_ref().expect("job already finished")
    }

    /// Mutable access to the job payload.
    pub fn get_mut(&mut self) -> &mut D::Job {
        self.payload.as_mut().expect("job already finished")
    }

    /// Report the job's outcome and return its slot to the task.
    pub fn finish(mut self, retcode: i32) {
        self.finish_inner(retcode);
    }

    fn finish_inner(&mut self, retcode: i32) {
        let Some(set) = self.set.take() else {
            return;
        };
        let job = self.payload.take().expect("job payload missing");

        let state = if retcode == 0 {
            JobState::Done
        } else {
            JobState::Fail(retcode)
        };

        inc_ref(&set);
        set.state.lock().ready.push_back(Ready {
            job,
            state: Some(state),
        });
        drive(&set);
        dec_ref(&set);
    }
}

impl<D: TaskDriver> Drop for TaskJob<D> {
    fn drop(&mut self) {
        if self.set.is_some() {
            tracing::error!("sub-job dropped without a result, counting it as failed");
            self.finish_inner(-1);
        }
    }
}

/// Run `driver`'s task with at most `depth` (clamped to 4..=128) sub-jobs
/// outstanding. Returns as soon as the initial window is dispatched; the
/// driver's `done` hook marks actual completion.
pub fn process<D: TaskDriver>(depth: u32, driver: D) {
    let depth = depth.clamp(MIN_DEPTH, MAX_DEPTH);

    let set = Arc::new(SetInner {
        driver,
        state: Mutex::new(SetState {
            run: false,
            no_jobs: false,
            ready: VecDeque::new(),
        }),
        retcode: AtomicI32::new(0),
        cur_depth: AtomicU32::new(0),
        refs: AtomicI32::new(1),
        done: AtomicBool::new(false),
    });

    for _ in 0..depth {
        fetch_one(&set);
        if set.state.lock().no_jobs {
            break;
        }
    }

    inc_ref(&set);
    drive(&set);
    dec_ref(&set);
}

fn fetch_one<D: TaskDriver>(set: &Arc<SetInner<D>>) {
    if set.retcode.load(Ordering::SeqCst) != 0 {
        set.state.lock().no_jobs = true;
        return;
    }

    match set.driver.fetch() {
        None => set.state.lock().no_jobs = true,
        Some(job) => {
            let mut state = set.state.lock();
            state.ready.push_back(Ready { job, state: None });
            let _ = set.cur_depth.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn drive<D: TaskDriver>(set: &Arc<SetInner<D>>) {
    let mut state = set.state.lock();
    if state.run {
        return;
    }
    state.run = true;

    while let Some(item) = state.ready.pop_front() {
        drop(state);

        match item.state {
            None => set.driver.handle(TaskJob {
                payload: Some(item.job),
                set: Some(set.clone()),
            }),
            Some(JobState::Done) => {
                let mut job = item.job;
                set.driver.release(&mut job);
                drop(job);
                let _ = set.cur_depth.fetch_sub(1, Ordering::SeqCst);
                fetch_one(set);
            }
            Some(JobState::Fail(rc)) => {
                set.retcode.store(rc, Ordering::SeqCst);
                set.state.lock().no_jobs = true;

                let mut job = item.job;
                set.driver.release(&mut job);
                drop(job);
                let _ = set.cur_depth.fetch_sub(1, Ordering::SeqCst);
            }
        }

        state = set.state.lock();
    }

    if state.no_jobs && set.cur_depth.load(Ordering::SeqCst) == 0 {
        let settled = set
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if settled {
            // The initial reference; cannot be the last one while a caller
            // is inside drive().
            let _ = set.refs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    state.run = false;
    drop(state);
}

fn inc_ref<D: TaskDriver>(set: &Arc<SetInner<D>>) {
    let _ = set.refs.fetch_add(1, Ordering::SeqCst);
}

fn dec_ref<D: TaskDriver>(set: &Arc<SetInner<D>>) {
    let remaining = set.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining < 0 {
        panic!("task set reference count underflow ({remaining})");
    }

    if remaining == 0 {
        set.driver.done(set.retcode.load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SleepyDriver {
        remaining: AtomicI32,
        fail_at: Option<i32>,
        active: AtomicI32,
        peak: AtomicI32,
        done_ret: Mutex<Vec<i32>>,
        released: AtomicI32,
    }

    impl SleepyDriver {
        fn new(jobs: i32, fail_at: Option<i32>) -> Self {
            SleepyDriver {
                remaining: AtomicI32::new(jobs),
                fail_at,
                active: AtomicI32::new(0),
                peak: AtomicI32::new(0),
                done_ret: Mutex::new(Vec::new()),
                released: AtomicI32::new(0),
            }
        }
    }

    impl TaskDriver for Arc<SleepyDriver> {
        type Job = i32;

        fn fetch(&self) -> Option<i32> {
            let left = self.remaining.fetch_sub(1, Ordering::SeqCst);
            (left > 0).then_some(left)
        }

        fn handle(&self, job: TaskJob<Self>) {
            let id = *job.get();
            let me = self.clone();
            let _ = std::thread::spawn(move || {
                let now = me.active.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = me.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                let _ = me.active.fetch_sub(1, Ordering::SeqCst);

                let failed = me.fail_at == Some(id);
                job.finish(if failed { -5 } else { 0 });
            });
        }

        fn release(&self, _job: &mut i32) {
            let _ = self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn done(&self, retcode: i32) {
            self.done_ret.lock().push(retcode);
        }
    }

    fn wait_done(driver: &SleepyDriver) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while driver.done_ret.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn concurrency_stays_under_depth_and_done_fires_once() {
        let driver = Arc::new(SleepyDriver::new(100, None));
        process(8, driver.clone());
        wait_done(&driver);

        assert_eq!(*driver.done_ret.lock(), vec![0]);
        assert!(driver.peak.load(Ordering::SeqCst) <= 8);
        assert_eq!(driver.released.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn failure_latches_the_return_code() {
        let driver = Arc::new(SleepyDriver::new(40, Some(20)));
        process(4, driver.clone());
        wait_done(&driver);

        assert_eq!(*driver.done_ret.lock(), vec![-5]);
        // The failure stops fetching: well under 40 jobs get released.
        assert!(driver.released.load(Ordering::SeqCst) < 40);
    }

    #[test]
    fn empty_task_completes_immediately() {
        let driver = Arc::new(SleepyDriver::new(0, None));
        process(8, driver.clone());
        wait_done(&driver);
        assert_eq!(*driver.done_ret.lock(), vec![0]);
    }
}
