// SPDX-License-Identifier: Apache-2.0

//! Worker threads: each drains a FIFO ready queue and polls its tasks.

use crate::cosem::CoSemInner;
use crate::lwt::{Lwt, set_current};
use crate::manager::ManagerCore;
use crate::stats::{CoStats, LwtOp};
use corun_bitmap::SlotPool;
use corun_threading::{RawHandle, RawService};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll, Waker};

/// Queues protected by the per-worker lock.
pub(crate) struct WorkerQueues {
    /// Tasks ready to run, in arrival order.
    pub(crate) ready: VecDeque<Arc<Lwt>>,
    /// Semaphores with a waiter parked on this worker.
    pub(crate) sems: VecDeque<Arc<CoSemInner>>,
    /// Ready-queue occupancy; the worker sleeps while it is zero.
    pub(crate) wait: u32,
}

/// One scheduling thread. Every task spawned onto this worker stays here
/// for its whole life.
pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) queues: Mutex<WorkerQueues>,
    /// Live tasks bound to this worker.
    pub(crate) lwt_count: AtomicI32,
    pub(crate) stats: Arc<CoStats>,
    pub(crate) pool: Arc<SlotPool<Arc<Lwt>>>,
    /// Timestamp slot shared between run and suspend accounting.
    pub(crate) run_ts: AtomicU64,
    pub(crate) mgr: OnceLock<Weak<ManagerCore>>,
    wake: OnceLock<RawHandle>,
}

impl Worker {
    pub(crate) fn new(index: usize, stats: Arc<CoStats>, pool: Arc<SlotPool<Arc<Lwt>>>) -> Self {
        Worker {
            index,
            queues: Mutex::new(WorkerQueues {
                ready: VecDeque::new(),
                sems: VecDeque::new(),
                wait: 0,
            }),
            lwt_count: AtomicI32::new(0),
            stats,
            pool,
            run_ts: AtomicU64::new(0),
            mgr: OnceLock::new(),
            wake: OnceLock::new(),
        }
    }

    pub(crate) fn attach(&self, handle: RawHandle) {
        let _ = self.wake.set(handle);
    }

    pub(crate) fn wakeup(&self) {
        if let Some(handle) = self.wake.get() {
            handle.wakeup();
        }
    }

    /// Poll one task as the thread-current coroutine. A `Pending` result
    /// means some suspension point took custody of the task; `Ready` means
    /// completion: the pool slot is released first, then the finalizer runs
    /// outside every scheduler lock.
    pub(crate) fn execute(&self, lwt: &Arc<Lwt>) {
        let Some(mut future) = lwt.future.lock().take() else {
            return;
        };

        set_current(Some(lwt.clone()));
        self.stats.begin(LwtOp::Run, &self.run_ts);

        let waker = Waker::from(lwt.clone());
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);

        set_current(None);

        match poll {
            Poll::Pending => {
                *lwt.future.lock() = Some(future);
                self.stats
                    .end(LwtOp::Sche, self.run_ts.load(Ordering::SeqCst));
            }
            Poll::Ready(()) => {
                self.stats
                    .end(LwtOp::Run, self.run_ts.load(Ordering::SeqCst));
                drop(future);

                let finalizer = lwt.finalizer.lock().take();
                self.release_slot(lwt);
                if let Some(finalizer) = finalizer {
                    finalizer();
                }
                let _ = self.lwt_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn release_slot(&self, lwt: &Arc<Lwt>) {
        if let Some(&slot) = lwt.slot.get() {
            if let Err(e) = self.pool.free(slot) {
                tracing::error!(worker = self.index, error = %e, "task slot release failed");
            }
        }
    }
}

impl RawService for Worker {
    fn run(&self) {
        let batch = {
            let mut queues = self.queues.lock();
            queues.wait = 0;
            std::mem::take(&mut queues.ready)
        };

        for lwt in batch {
            self.stats
                .end(LwtOp::Que, lwt.queued_at.load(Ordering::SeqCst));
            self.execute(&lwt);
        }
    }

    fn need_sleep(&self) -> bool {
        self.queues.lock().wait == 0
    }

    /// Shutdown: queued tasks are dropped without running; parked semaphore
    /// waiters are resumed with an error result so their tasks can unwind.
    fn cleanup(&self) {
        {
            let mut queues = self.queues.lock();
            queues.wait = 0;
            while let Some(lwt) = queues.ready.pop_front() {
                self.release_slot(&lwt);
                let _ = self.lwt_count.fetch_sub(1, Ordering::SeqCst);
            }
        }

        loop {
            let sem = self.queues.lock().sems.pop_front();
            let Some(sem) = sem else {
                break;
            };

            sem.ret.store(-1, Ordering::SeqCst);
            sem.queued.store(false, Ordering::SeqCst);
            let owner = sem.owner().clone();
            self.execute(&owner);
        }
    }
}
