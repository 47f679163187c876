// SPDX-License-Identifier: Apache-2.0

//! The coroutine manager: task pool, workers, sleeper timer.

use crate::backend;
use crate::costat;
use crate::error::CoroutineError;
use crate::lwt::{Finalizer, Lwt};
use crate::sleeper::SleeperList;
use crate::stats::{CoStats, OP_COUNT, OpSnapshot};
use crate::worker::Worker;
use corun_bitmap::SlotPool;
use corun_threading::{RawThread, Stimer};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

const MIN_LWT: u32 = 16;
const MIN_WORKER: u32 = 1;
/// Sleeper granularity: one tick per millisecond.
const TICK_MS: u32 = 1;

pub(crate) struct ManagerCore {
    pub(crate) name: String,
    pub(crate) stats: Arc<CoStats>,
    pub(crate) pool: Arc<SlotPool<Arc<Lwt>>>,
    pub(crate) workers: Vec<Arc<Worker>>,
    pub(crate) sleepers: SleeperList,
    rr: AtomicU32,
}

/// Snapshot served through the `costat` channel.
pub(crate) struct ManagerInfo {
    pub(crate) name: String,
    pub(crate) worker_total: u32,
    pub(crate) lwt_total: u32,
    pub(crate) lwt_used: u32,
    pub(crate) per_worker: Vec<u32>,
    pub(crate) ops: [OpSnapshot; OP_COUNT],
}

impl ManagerCore {
    pub(crate) fn info(&self) -> ManagerInfo {
        let usage = self.pool.usage();
        ManagerInfo {
            name: self.name.clone(),
            worker_total: self.workers.len() as u32,
            lwt_total: usage.capacity as u32,
            lwt_used: usage.used,
            per_worker: self
                .workers
                .iter()
                .map(|w| w.lwt_count.load(Ordering::SeqCst).max(0) as u32)
                .collect(),
            ops: self.stats.snapshot(),
        }
    }

    pub(crate) fn reset_info(&self) {
        self.stats.reset();
    }
}

/// M:N scheduler handle.
///
/// Dropping the manager is a graceful shutdown: the sleeper timer stops,
/// parked sleepers are handed back to their workers, queued tasks are
/// discarded without running, and semaphore waiters resume with an error
/// so their tasks can unwind through their finalizers.
pub struct CoroutineManager {
    core: Arc<ManagerCore>,
    timer: Option<Stimer>,
    worker_threads: Vec<RawThread>,
}

impl CoroutineManager {
    /// Create a manager with `max_lwt` task slots (at least 16) spread over
    /// `max_workers` scheduling threads (at least 1).
    ///
    /// The first manager also installs the coroutine-aware semaphore
    /// backend for the whole process.
    ///
    /// # Errors
    ///
    /// Worker or timer thread creation failures.
    pub fn new(name: &str, max_lwt: u32, max_workers: u32) -> Result<Self, CoroutineError> {
        let max_lwt = max_lwt.max(MIN_LWT);
        let worker_count = max_workers.max(MIN_WORKER) as usize;

        let stats = Arc::new(CoStats::default());
        let pool = Arc::new(
            SlotPool::new(max_lwt as usize).map_err(|_| CoroutineError::TasksExhausted)?,
        );

        let workers: Vec<Arc<Worker>> = (0..worker_count)
            .map(|i| Arc::new(Worker::new(i, stats.clone(), pool.clone())))
            .collect();

        let core = Arc::new(ManagerCore {
            name: name.to_string(),
            stats,
            pool,
            workers,
            sleepers: SleeperList::default(),
            rr: AtomicU32::new(0),
        });

        for worker in &core.workers {
            let _ = worker.mgr.set(Arc::downgrade(&core));
        }

        let mut worker_threads = Vec::with_capacity(worker_count);
        for (i, worker) in core.workers.iter().enumerate() {
            let thread = RawThread::spawn(format!("{:.8}{i}", name), worker.clone())?;
            worker.attach(thread.handle());
            worker_threads.push(thread);
        }

        backend::register_once();

        let tick_core: Weak<ManagerCore> = Arc::downgrade(&core);
        let timer = Stimer::new(format!("{:.4}Timer", name), TICK_MS, move || {
            if let Some(core) = tick_core.upgrade() {
                for lwt in core.sleepers.tick() {
                    lwt.schedule();
                }
            }
        })?;

        costat::register(&core);

        Ok(CoroutineManager {
            core,
            timer: Some(timer),
            worker_threads,
        })
    }

    /// Number of scheduling workers.
    pub fn workers(&self) -> usize {
        self.core.workers.len()
    }

    /// Spawn a task on the next worker in round-robin order.
    ///
    /// # Errors
    ///
    /// [`CoroutineError::TasksExhausted`] when the task pool stays full
    /// through the allocation backoff; no finalizer is involved.
    pub fn spawn<F>(&self, future: F) -> Result<(), CoroutineError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let index = self.next_worker();
        self.spawn_inner(index, Box::pin(future), None)
    }

    /// Spawn with a finalizer that runs after the task completes (or is
    /// discarded during shutdown unwinding), outside every scheduler lock.
    ///
    /// # Errors
    ///
    /// See [`CoroutineManager::spawn`]; on error the finalizer is not run.
    pub fn spawn_with_finalizer<F, D>(&self, future: F, finalizer: D) -> Result<(), CoroutineError>
    where
        F: Future<Output = ()> + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        let index = self.next_worker();
        self.spawn_inner(index, Box::pin(future), Some(Box::new(finalizer)))
    }

    /// Spawn pinned to a specific worker instead of round-robin.
    ///
    /// # Errors
    ///
    /// [`CoroutineError::WorkerOutOfRange`] plus the [`CoroutineManager::spawn`]
    /// failure modes.
    pub fn spawn_on<F>(&self, worker: usize, future: F) -> Result<(), CoroutineError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if worker >= self.core.workers.len() {
            return Err(CoroutineError::WorkerOutOfRange {
                worker,
                count: self.core.workers.len(),
            });
        }
        self.spawn_inner(worker, Box::pin(future), None)
    }

    fn next_worker(&self) -> usize {
        let index = self.core.rr.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        index as usize % self.core.workers.len()
    }

    fn spawn_inner(
        &self,
        worker_index: usize,
        future: crate::lwt::LwtFuture,
        finalizer: Option<Finalizer>,
    ) -> Result<(), CoroutineError> {
        let worker = self.core.workers[worker_index].clone();
        let lwt = Arc::new(Lwt::new(worker, future, finalizer));

        let slot = self
            .core
            .pool
            .alloc(lwt.clone())
            .map_err(|_| {
                tracing::error!(manager = %self.core.name, "task pool exhausted");
                CoroutineError::TasksExhausted
            })?;
        let _ = lwt.slot.set(slot);

        let _ = lwt.worker.lwt_count.fetch_add(1, Ordering::SeqCst);
        lwt.schedule();
        Ok(())
    }
}

impl Drop for CoroutineManager {
    fn drop(&mut self) {
        costat::unregister(&self.core.name);

        // Stop the tick source, then hand parked sleepers back to their
        // workers; the workers drain them during their own teardown.
        drop(self.timer.take());
        for lwt in self.core.sleepers.drain() {
            lwt.schedule();
        }

        self.worker_threads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosem::CoSem;
    use crate::ops::{sleep_ms, yield_now};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline_ms: u64, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn spawned_tasks_run_and_finalize() {
        let mgr = CoroutineManager::new("cmRun", 32, 2).expect("manager");
        let ran = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let ran = ran.clone();
            let finalized = finalized.clone();
            mgr.spawn_with_finalizer(
                async move {
                    let _ = ran.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    let _ = finalized.fetch_add(1, Ordering::SeqCst);
                },
            )
            .expect("spawn");
        }

        assert!(wait_until(2_000, || finalized.load(Ordering::SeqCst) == 10));
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn yield_interleaves_tasks_on_one_worker() {
        let mgr = CoroutineManager::new("cmYield", 32, 1).expect("manager");
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..2u32 {
            let log = log.clone();
            mgr.spawn_on(0, async move {
                for round in 0..3u32 {
                    log.lock().push((id, round));
                    yield_now().await;
                }
            })
            .expect("spawn");
        }

        assert!(wait_until(2_000, || log.lock().len() == 6));

        // Rounds strictly alternate between the two tasks.
        let seen = log.lock();
        for round in 0..3u32 {
            let entries: Vec<u32> = seen
                .iter()
                .filter(|(_, r)| *r == round)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(entries.len(), 2, "round {round} incomplete: {seen:?}");
        }
    }

    #[test]
    fn sleep_wakes_in_deadline_order() {
        let mgr = CoroutineManager::new("cmSleep", 32, 2).expect("manager");
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, ms) in [("a", 60u32), ("b", 20), ("c", 40)] {
            let order = order.clone();
            mgr.spawn_on(0, async move {
                sleep_ms(ms).await;
                order.lock().push(tag);
            })
            .expect("spawn");
        }

        assert!(wait_until(3_000, || order.lock().len() == 3));
        assert_eq!(*order.lock(), vec!["b", "c", "a"]);
    }

    #[test]
    fn cosem_rendezvous() {
        let mgr = CoroutineManager::new("cmSem", 32, 2).expect("manager");
        let (tx, rx) = std::sync::mpsc::channel::<CoSem>();
        let result = Arc::new(Mutex::new(None));

        let seen = result.clone();
        mgr.spawn(async move {
            let sem = CoSem::new().expect("bound to this coroutine");
            tx.send(sem.clone()).expect("handoff");
            let outcome = sem.down().await;
            *seen.lock() = Some(outcome.is_ok());
            sem.close().expect("pairing settled");
        })
        .expect("spawn waiter");

        let sem = rx.recv_timeout(Duration::from_secs(2)).expect("semaphore");
        std::thread::sleep(Duration::from_millis(5));
        sem.up();

        assert!(wait_until(2_000, || result.lock().is_some()));
        assert_eq!(*result.lock(), Some(true));
    }

    #[test]
    fn up_before_down_does_not_park() {
        let mgr = CoroutineManager::new("cmSemUp", 32, 1).expect("manager");
        let done = Arc::new(AtomicUsize::new(0));

        let seen = done.clone();
        mgr.spawn(async move {
            let sem = CoSem::new().expect("cosem");
            sem.up();
            sem.down().await.expect("no park needed");
            let _ = seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn");

        assert!(wait_until(2_000, || done.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn pool_exhaustion_fails_spawn() {
        let mgr = CoroutineManager::new("cmFull", 16, 1).expect("manager");

        // Park 16 tasks until long after the test ends.
        for _ in 0..16 {
            mgr.spawn(async {
                sleep_ms(600_000).await;
            })
            .expect("spawn");
        }

        assert!(wait_until(2_000, || mgr.core.pool.usage().used == 16));
        assert!(matches!(
            mgr.spawn(async {}),
            Err(CoroutineError::TasksExhausted)
        ));
    }

    #[test]
    fn shutdown_resumes_sem_waiters_with_error() {
        let mgr = CoroutineManager::new("cmDown", 32, 1).expect("manager");
        let outcome = Arc::new(Mutex::new(None));

        let seen = outcome.clone();
        mgr.spawn(async move {
            let sem = CoSem::new().expect("cosem");
            let result = sem.down().await;
            *seen.lock() = Some(result.is_err());
        })
        .expect("spawn");

        // Give the task time to park, then shut the manager down.
        std::thread::sleep(Duration::from_millis(50));
        drop(mgr);

        assert_eq!(*outcome.lock(), Some(true));
    }
}
