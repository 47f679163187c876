// SPDX-License-Identifier: Apache-2.0

//! Internal wakeup counter for service threads.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Posts are capped so a hot producer cannot grow the counter without bound.
const POST_MAX: u32 = 1024;

/// Counting wakeup primitive with capped posts and timed waits.
///
/// This is the per-thread wakeup channel of the pool and raw threads, not
/// the public [`crate::Sema`]: it tolerates lost and spurious wakeups by
/// design because every waiter re-checks its own condition on a 100 ms
/// cadence.
pub(crate) struct Wakeup {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Wakeup {
    pub(crate) fn new() -> Self {
        Wakeup {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Post one wakeup unless the counter is saturated.
    pub(crate) fn post(&self) {
        let mut count = self.count.lock();
        if *count < POST_MAX {
            *count += 1;
            self.cv.notify_one();
        }
    }

    /// Post one wakeup regardless of saturation. Used on shutdown.
    pub(crate) fn post_force(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_all();
    }

    /// Wait for a post, up to `timeout`. Returns whether a post was consumed.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            let _ = self.cv.wait_for(&mut count, timeout);
        }

        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}
