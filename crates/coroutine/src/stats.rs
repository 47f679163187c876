// SPDX-License-Identifier: Apache-2.0

//! Per-operation latency accounting behind the `costat` channel.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Scheduler operations with begin/end accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LwtOp {
    /// Time spent queued on a worker's ready list.
    Que = 0,
    /// Time spent running user code.
    Run = 1,
    /// Time from suspension to the worker moving on.
    Sche = 2,
    /// Time from a semaphore release to the waiter resuming.
    Semup = 3,
}

pub(crate) const OP_COUNT: usize = 4;
pub(crate) const OP_NAMES: [&str; OP_COUNT] = ["LwtQue", "LwtRun", "LwtSche", "LwtSemup"];

static CLOCK_ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

fn now_ns() -> u64 {
    CLOCK_ANCHOR.elapsed().as_nanos() as u64
}

#[derive(Default)]
struct OpStat {
    begin: AtomicU64,
    end: AtomicU64,
    delay_us: AtomicU64,
    max_us: AtomicU64,
}

/// One row of the `costat` operation table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpSnapshot {
    pub name: &'static str,
    /// Operations begun but not yet ended.
    pub doing: u64,
    /// Mean latency in microseconds.
    pub avg_us: u64,
    /// Worst latency in microseconds.
    pub max_us: u64,
}

/// Begin/end counters for every scheduler operation of one manager.
#[derive(Default)]
pub(crate) struct CoStats {
    ops: [OpStat; OP_COUNT],
}

impl CoStats {
    /// Mark an operation begun, stamping `ts` with the begin time.
    pub(crate) fn begin(&self, op: LwtOp, ts: &AtomicU64) {
        ts.store(now_ns(), Ordering::SeqCst);
        let _ = self.ops[op as usize].begin.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark an operation ended, accumulating latency since `start_ns`.
    pub(crate) fn end(&self, op: LwtOp, start_ns: u64) {
        let stat = &self.ops[op as usize];
        let _ = stat.end.fetch_add(1, Ordering::SeqCst);

        let cost_us = now_ns().saturating_sub(start_ns) / 1_000;
        let _ = stat.delay_us.fetch_add(cost_us, Ordering::SeqCst);
        let _ = stat.max_us.fetch_max(cost_us, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        for stat in &self.ops {
            stat.begin.store(0, Ordering::SeqCst);
            stat.end.store(0, Ordering::SeqCst);
            stat.delay_us.store(0, Ordering::SeqCst);
            stat.max_us.store(0, Ordering::SeqCst);
        }
    }

    pub(crate) fn snapshot(&self) -> [OpSnapshot; OP_COUNT] {
        std::array::from_fn(|i| {
            let begin = self.ops[i].begin.load(Ordering::SeqCst);
            let end = self.ops[i].end.load(Ordering::SeqCst);
            OpSnapshot {
                name: OP_NAMES[i],
                doing: begin.saturating_sub(end),
                avg_us: if end == 0 {
                    0
                } else {
                    self.ops[i].delay_us.load(Ordering::SeqCst) / end
                },
                max_us: self.ops[i].max_us.load(Ordering::SeqCst),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_end_balances_doing() {
        let stats = CoStats::default();
        let ts = AtomicU64::new(0);

        stats.begin(LwtOp::Run, &ts);
        assert_eq!(stats.snapshot()[LwtOp::Run as usize].doing, 1);

        stats.end(LwtOp::Run, ts.load(Ordering::SeqCst));
        assert_eq!(stats.snapshot()[LwtOp::Run as usize].doing, 0);
    }

    #[test]
    fn reset_zeroes_counters() {
        let stats = CoStats::default();
        let ts = AtomicU64::new(0);
        stats.begin(LwtOp::Que, &ts);
        stats.end(LwtOp::Que, ts.load(Ordering::SeqCst));

        stats.reset();
        let snap = stats.snapshot()[LwtOp::Que as usize];
        assert_eq!((snap.doing, snap.avg_us, snap.max_us), (0, 0, 0));
    }
}
