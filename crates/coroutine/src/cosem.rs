// SPDX-License-Identifier: Apache-2.0

//! Coroutine-local semaphore.
//!
//! A `CoSem` is bound at creation to the coroutine that will wait on it.
//! `up` and `down` pair one to one; the signed counter is only touched
//! under the owning worker's lock, which makes it the single source of
//! truth for the up/down race. The waiting task parks in its worker's
//! semaphore queue, so the worker thread stays free to run other tasks.

use crate::error::CoroutineError;
use crate::lwt::{Lwt, current};
use crate::stats::LwtOp;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::task::{Context, Poll};

pub(crate) struct CoSemInner {
    owner: Arc<Lwt>,
    /// Signed pairing counter: positive while a waiter is parked, negative
    /// while releases outrun waits.
    val: AtomicI32,
    /// Result delivered to the waiter; non-zero only on shutdown.
    pub(crate) ret: AtomicI32,
    /// Whether the semaphore sits in its worker's wait queue.
    pub(crate) queued: AtomicBool,
    semup_ts: AtomicU64,
}

impl CoSemInner {
    pub(crate) fn owner(&self) -> &Arc<Lwt> {
        &self.owner
    }
}

/// A semaphore that blocks the owning coroutine, not its worker thread.
///
/// Clones share the same semaphore so other tasks and threads can release
/// it. Dropping the last clone while a pairing is still outstanding is
/// reported as an error.
#[derive(Clone)]
pub struct CoSem {
    inner: Arc<CoSemInner>,
}

impl CoSem {
    /// Bind a semaphore to the calling coroutine.
    ///
    /// # Errors
    ///
    /// [`CoroutineError::NotACoroutine`] outside a coroutine.
    pub fn new() -> Result<Self, CoroutineError> {
        let owner = current().ok_or_else(|| {
            tracing::error!("coroutine semaphore created outside a coroutine");
            CoroutineError::NotACoroutine
        })?;

        Ok(CoSem {
            inner: Arc::new(CoSemInner {
                owner,
                val: AtomicI32::new(0),
                ret: AtomicI32::new(0),
                queued: AtomicBool::new(false),
                semup_ts: AtomicU64::new(0),
            }),
        })
    }

    /// Release the owner. If the owner is parked it moves to its worker's
    /// ready queue; if the release wins the race, the owner's next
    /// [`CoSem::down`] returns immediately.
    pub fn up(&self) {
        let inner = &self.inner;
        let worker = inner.owner.worker.clone();

        let mut queues = worker.queues.lock();
        let val = inner.val.fetch_sub(1, Ordering::SeqCst) - 1;
        if val != 0 {
            return;
        }

        worker.stats.begin(LwtOp::Semup, &inner.semup_ts);
        if inner.queued.swap(false, Ordering::SeqCst) {
            queues.sems.retain(|s| !Arc::ptr_eq(s, inner));
        }

        worker.stats.begin(LwtOp::Que, &inner.owner.queued_at);
        queues.ready.push_back(inner.owner.clone());
        queues.wait += 1;
        drop(queues);

        worker.wakeup();
    }

    /// Wait for the paired [`CoSem::up`]. Must be awaited by the owning
    /// coroutine.
    ///
    /// # Errors
    ///
    /// [`CoroutineError::Shutdown`] when the wait was cut short by worker
    /// shutdown, [`CoroutineError::NotOwner`] when awaited from a foreign
    /// task.
    pub fn down(&self) -> Down {
        Down {
            inner: self.inner.clone(),
            parked: false,
        }
    }

    /// Tear the semaphore down.
    ///
    /// # Errors
    ///
    /// [`CoroutineError::SemInUse`] while a pairing is outstanding.
    pub fn close(self) -> Result<(), CoroutineError> {
        let inner = &self.inner;
        if inner.queued.load(Ordering::SeqCst) || inner.val.load(Ordering::SeqCst) != 0 {
            tracing::error!(
                val = inner.val.load(Ordering::SeqCst),
                "coroutine semaphore still in use"
            );
            return Err(CoroutineError::SemInUse);
        }
        Ok(())
    }
}

/// Future returned by [`CoSem::down`].
pub struct Down {
    inner: Arc<CoSemInner>,
    parked: bool,
}

impl Future for Down {
    type Output = Result<(), CoroutineError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.clone();
        let worker = &inner.owner.worker;

        if self.parked {
            worker
                .stats
                .end(LwtOp::Semup, inner.semup_ts.load(Ordering::SeqCst));
            let ret = inner.ret.load(Ordering::SeqCst);
            return Poll::Ready(if ret == 0 {
                Ok(())
            } else {
                Err(CoroutineError::Shutdown)
            });
        }

        match current() {
            Some(lwt) if Arc::ptr_eq(&lwt, &inner.owner) => {}
            _ => {
                tracing::error!("coroutine semaphore waited on by a foreign task");
                return Poll::Ready(Err(CoroutineError::NotOwner));
            }
        }

        worker
            .stats
            .end(LwtOp::Run, worker.run_ts.load(Ordering::SeqCst));

        let mut queues = worker.queues.lock();
        let val = inner.val.fetch_add(1, Ordering::SeqCst) + 1;
        if val <= 0 {
            // The release already happened; no need to park.
            return Poll::Ready(Ok(()));
        }

        inner.queued.store(true, Ordering::SeqCst);
        queues.sems.push_back(inner.clone());
        worker.stats.begin(LwtOp::Sche, &worker.run_ts);
        drop(queues);

        self.parked = true;
        Poll::Pending
    }
}

impl Drop for CoSemInner {
    fn drop(&mut self) {
        if self.queued.load(Ordering::SeqCst) || self.val.load(Ordering::SeqCst) != 0 {
            tracing::error!(
                val = self.val.load(Ordering::SeqCst),
                "coroutine semaphore dropped while in use"
            );
        }
    }
}
