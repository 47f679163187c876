// SPDX-License-Identifier: Apache-2.0

//! The lightweight task and the thread-current task slot.

use crate::stats::LwtOp;
use crate::worker::Worker;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::task::Wake;

pub(crate) type LwtFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type Finalizer = Box<dyn FnOnce() + Send>;

/// One lightweight task: the user's future, an optional finalizer, the
/// worker the task is bound to for life, and its slot in the task pool.
///
/// While the task is not running, its `Arc` sits on exactly one queue: the
/// worker's ready list, a semaphore wait queue, or the sleeper list.
pub(crate) struct Lwt {
    pub(crate) worker: Arc<Worker>,
    pub(crate) slot: OnceLock<usize>,
    pub(crate) future: Mutex<Option<LwtFuture>>,
    pub(crate) finalizer: Mutex<Option<Finalizer>>,
    /// Stamped when the task is enqueued; drives queue-latency accounting.
    pub(crate) queued_at: AtomicU64,
}

impl Lwt {
    pub(crate) fn new(worker: Arc<Worker>, future: LwtFuture, finalizer: Option<Finalizer>) -> Self {
        Lwt {
            worker,
            slot: OnceLock::new(),
            future: Mutex::new(Some(future)),
            finalizer: Mutex::new(finalizer),
            queued_at: AtomicU64::new(0),
        }
    }

    /// Append the task to its worker's ready queue and wake the worker.
    pub(crate) fn schedule(self: Arc<Self>) {
        let worker = self.worker.clone();
        {
            let mut queues = worker.queues.lock();
            worker.stats.begin(LwtOp::Que, &self.queued_at);
            queues.ready.push_back(self);
            queues.wait += 1;
        }
        worker.wakeup();
    }
}

impl Wake for Lwt {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().schedule();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Lwt>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(lwt: Option<Arc<Lwt>>) {
    CURRENT.with(|slot| *slot.borrow_mut() = lwt);
}

pub(crate) fn current() -> Option<Arc<Lwt>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Whether the calling thread is currently executing a coroutine.
pub fn is_coroutine() -> bool {
    CURRENT.with(|slot| slot.borrow().is_some())
}
