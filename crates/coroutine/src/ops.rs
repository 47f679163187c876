// SPDX-License-Identifier: Apache-2.0

//! Suspension points usable inside a coroutine.

use crate::lwt::current;
use crate::stats::LwtOp;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Hand the worker back to the next ready task; this task re-queues at the
/// tail of its own worker's ready list.
///
/// Outside a coroutine this is a no-op.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        let Some(lwt) = current() else {
            tracing::error!("yield_now outside a coroutine");
            return Poll::Ready(());
        };

        let worker = lwt.worker.clone();
        worker
            .stats
            .end(LwtOp::Run, worker.run_ts.load(Ordering::SeqCst));
        worker.stats.begin(LwtOp::Sche, &worker.run_ts);

        self.yielded = true;
        lwt.schedule();
        Poll::Pending
    }
}

/// Park this task on the manager's sleeper list for `ms` milliseconds of
/// timer ticks; the worker keeps running other tasks meanwhile.
///
/// Outside a coroutine this logs an error and returns immediately.
pub fn sleep_ms(ms: u32) -> Sleep {
    Sleep {
        timeout: ms,
        parked: false,
    }
}

/// Future returned by [`sleep_ms`].
pub struct Sleep {
    timeout: u32,
    parked: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            return Poll::Ready(());
        }

        let Some(lwt) = current() else {
            tracing::error!("sleep_ms outside a coroutine");
            return Poll::Ready(());
        };

        let Some(mgr) = lwt.worker.mgr.get().and_then(std::sync::Weak::upgrade) else {
            return Poll::Ready(());
        };

        let worker = lwt.worker.clone();
        worker
            .stats
            .end(LwtOp::Run, worker.run_ts.load(Ordering::SeqCst));

        mgr.sleepers.insert(lwt.clone(), self.timeout);
        worker.stats.begin(LwtOp::Sche, &worker.run_ts);

        self.parked = true;
        Poll::Pending
    }
}
