// SPDX-License-Identifier: Apache-2.0

//! Coroutine-side semaphore backend.
//!
//! Registered once per process by the first manager. The backend is picked
//! by [`corun_threading::Sema`] when a semaphore is created inside a
//! coroutine; unlike the OS variant it tolerates release bursts without the
//! strict pairing guard. The wait itself is a thread-level park: Rust's
//! synchronous call boundary cannot suspend the coroutine from inside a
//! plain function, so async callers wanting a cooperative wait use
//! [`crate::CoSem`] directly.

use crate::lwt::is_coroutine;
use corun_threading::{BackendSema, SemaBackend};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Once};
use std::time::Duration;

struct BridgeSema {
    count: Mutex<i32>,
    cv: Condvar,
}

impl BackendSema for BridgeSema {
    fn up(&self) -> Result<(), corun_threading::Error> {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
        Ok(())
    }

    fn down(&self) -> Result<(), corun_threading::Error> {
        let mut count = self.count.lock();
        while *count <= 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
        Ok(())
    }
}

struct CoroutineBackend;

impl SemaBackend for CoroutineBackend {
    fn is_special(&self) -> bool {
        is_coroutine()
    }

    fn create(&self) -> Box<dyn BackendSema> {
        Box::new(BridgeSema {
            count: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

static REGISTER: Once = Once::new();

/// Install the backend into the process-wide slot, once.
pub(crate) fn register_once() {
    REGISTER.call_once(|| {
        if let Err(e) = corun_threading::register_backend(Arc::new(CoroutineBackend)) {
            tracing::warn!(error = %e, "semaphore backend already present");
        }
    });
}
