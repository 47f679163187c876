// SPDX-License-Identifier: Apache-2.0

//! Delta-encoded sleeper list.
//!
//! Entries are ordered by absolute wake time but store only the delta from
//! their predecessor, so a timer tick touches nothing but the head. The
//! list has its own lock, held together with no worker lock: the tick pops
//! due entries first and re-queues them afterwards.

use crate::lwt::Lwt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

struct SleepEntry {
    lwt: Arc<Lwt>,
    /// Remaining ticks relative to the predecessor entry.
    delta: u32,
}

#[derive(Default)]
pub(crate) struct SleeperList {
    entries: Mutex<VecDeque<SleepEntry>>,
}

impl SleeperList {
    /// File a task to wake after `timeout` ticks, preserving the delta
    /// encoding: walk the list consuming predecessors' deltas, slot in
    /// before the first larger entry and shrink it by the residual.
    pub(crate) fn insert(&self, lwt: Arc<Lwt>, timeout: u32) {
        let mut entries = self.entries.lock();

        let mut remaining = timeout;
        let mut position = None;
        for (idx, entry) in entries.iter_mut().enumerate() {
            if entry.delta > remaining {
                entry.delta -= remaining;
                position = Some(idx);
                break;
            }
            remaining -= entry.delta;
        }

        let entry = SleepEntry {
            lwt,
            delta: remaining,
        };
        match position {
            Some(idx) => entries.insert(idx, entry),
            None => entries.push_back(entry),
        }
    }

    /// One timer tick: decrement the head's delta and pop every entry that
    /// reached zero. The caller re-queues the returned tasks to their
    /// workers after this lock is released.
    pub(crate) fn tick(&self) -> Vec<Arc<Lwt>> {
        let mut entries = self.entries.lock();

        let Some(head) = entries.front_mut() else {
            return Vec::new();
        };
        if head.delta != 0 {
            head.delta -= 1;
        }
        if head.delta > 0 {
            return Vec::new();
        }

        let mut due = Vec::new();
        while let Some(entry) = entries.front() {
            if entry.delta != 0 {
                break;
            }
            due.push(entries.pop_front().expect("front exists").lwt);
        }
        due
    }

    /// Shutdown: hand every entry back regardless of its remaining time.
    pub(crate) fn drain(&self) -> Vec<Arc<Lwt>> {
        self.entries
            .lock()
            .drain(..)
            .map(|entry| entry.lwt)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn deltas(&self) -> Vec<u32> {
        self.entries.lock().iter().map(|e| e.delta).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CoStats;
    use crate::worker::Worker;
    use corun_bitmap::SlotPool;

    fn dummy_lwt() -> Arc<Lwt> {
        let stats = Arc::new(CoStats::default());
        let pool = Arc::new(SlotPool::new(16).expect("pool"));
        let worker = Arc::new(Worker::new(0, stats, pool));
        Arc::new(Lwt::new(worker, Box::pin(async {}), None))
    }

    #[test]
    fn inserts_keep_the_delta_encoding() {
        let list = SleeperList::default();
        list.insert(dummy_lwt(), 30);
        list.insert(dummy_lwt(), 10);
        list.insert(dummy_lwt(), 20);

        // Absolute deadlines 10, 20, 30 encoded as deltas 10, 10, 10.
        assert_eq!(list.deltas(), vec![10, 10, 10]);

        list.insert(dummy_lwt(), 15);
        assert_eq!(list.deltas(), vec![10, 5, 5, 10]);
    }

    #[test]
    fn ticks_pop_due_entries_in_batches() {
        let list = SleeperList::default();
        list.insert(dummy_lwt(), 2);
        list.insert(dummy_lwt(), 2);
        list.insert(dummy_lwt(), 3);

        assert!(list.tick().is_empty());
        // Second tick: both 2 ms sleepers wake together.
        assert_eq!(list.tick().len(), 2);
        assert_eq!(list.deltas(), vec![1]);
        assert_eq!(list.tick().len(), 1);
        assert!(list.tick().is_empty());
    }

    #[test]
    fn zero_timeout_wakes_on_the_next_tick() {
        let list = SleeperList::default();
        list.insert(dummy_lwt(), 0);
        assert_eq!(list.tick().len(), 1);
    }

    #[test]
    fn drain_hands_everything_back() {
        let list = SleeperList::default();
        list.insert(dummy_lwt(), 5);
        list.insert(dummy_lwt(), 50);
        assert_eq!(list.drain().len(), 2);
        assert!(list.tick().is_empty());
    }
}
