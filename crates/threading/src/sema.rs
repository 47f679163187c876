// SPDX-License-Identifier: Apache-2.0

//! Semaphore abstraction with a pluggable coroutine-aware backend.
//!
//! A [`Sema`] picks its backing implementation once, at construction: if a
//! backend is registered and reports the calling context as special (i.e.
//! the caller runs inside a coroutine), the semaphore is backend-provided;
//! otherwise it is an OS-style counting semaphore. The choice is permanent
//! for the lifetime of the value.

use crate::error::Error;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Pairing guard states for the OS-backed variant.
const COND_WAIT: u8 = 0;
const COND_DONE: u8 = 1;

/// Provider of coroutine-aware semaphores.
///
/// Registered once per process by the coroutine scheduler; consulted by
/// every [`Sema::new`] call.
pub trait SemaBackend: Send + Sync {
    /// Whether the calling context should use this backend.
    fn is_special(&self) -> bool;

    /// Build a semaphore bound to the calling context.
    fn create(&self) -> Box<dyn BackendSema>;

    /// Context-aware sleep for backoff loops.
    fn sleep_ms(&self, ms: u32);
}

/// One backend-provided semaphore instance.
pub trait BackendSema: Send + Sync {
    /// Release the paired waiter.
    fn up(&self) -> Result<(), Error>;

    /// Wait for the paired release.
    fn down(&self) -> Result<(), Error>;
}

static BACKEND: OnceLock<Arc<dyn SemaBackend>> = OnceLock::new();

/// Install the process-wide semaphore backend. The slot holds one entry.
///
/// # Errors
///
/// [`Error::BackendAlreadyRegistered`] if a backend is already installed.
pub fn register_backend(backend: Arc<dyn SemaBackend>) -> Result<(), Error> {
    BACKEND
        .set(backend)
        .map_err(|_| Error::BackendAlreadyRegistered)
}

struct OsSema {
    count: Mutex<u32>,
    cv: Condvar,
    /// Enforces strict one-up-per-one-down pairing: raising an already
    /// raised semaphore is a programmer error.
    cond: AtomicU8,
}

impl OsSema {
    fn new() -> Self {
        OsSema {
            count: Mutex::new(0),
            cv: Condvar::new(),
            cond: AtomicU8::new(COND_WAIT),
        }
    }

    fn up(&self) {
        {
            let mut count = self.count.lock();
            *count += 1;
            self.cv.notify_one();
        }

        if self
            .cond
            .compare_exchange(COND_WAIT, COND_DONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("semaphore raised twice without a matching wait");
        }
    }

    fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
        drop(count);

        while self
            .cond
            .compare_exchange(COND_DONE, COND_WAIT, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::thread::yield_now();
        }
    }
}

enum SemaKind {
    Os(OsSema),
    Backend {
        sema: Box<dyn BackendSema>,
        backend: Arc<dyn SemaBackend>,
    },
}

/// A one-shot-pairing semaphore: every `up` releases exactly one `down`.
pub struct Sema {
    kind: SemaKind,
}

impl Sema {
    /// Build a semaphore, dispatching to the registered backend when the
    /// calling context is special.
    pub fn new() -> Self {
        if let Some(backend) = BACKEND.get() {
            if backend.is_special() {
                return Sema {
                    kind: SemaKind::Backend {
                        sema: backend.create(),
                        backend: backend.clone(),
                    },
                };
            }
        }

        Sema {
            kind: SemaKind::Os(OsSema::new()),
        }
    }

    /// Release the paired waiter.
    ///
    /// # Panics
    ///
    /// On the OS-backed variant, panics if the semaphore is raised twice
    /// without an intervening [`Sema::down`]. A failing backend `up` also
    /// panics: it signals a fault the runtime cannot recover from.
    pub fn up(&self) {
        match &self.kind {
            SemaKind::Os(os) => os.up(),
            SemaKind::Backend { sema, .. } => {
                if let Err(e) = sema.up() {
                    panic!("backend semaphore up failed: {e}");
                }
            }
        }
    }

    /// Wait for the paired release. A backend wait cut short by shutdown is
    /// logged and treated as a release.
    pub fn down(&self) {
        match &self.kind {
            SemaKind::Os(os) => os.down(),
            SemaKind::Backend { sema, .. } => {
                if let Err(e) = sema.down() {
                    tracing::warn!(error = %e, "backend semaphore down failed");
                }
            }
        }
    }

    /// Sleep for `ms` milliseconds through the semaphore's context: the
    /// registered backend for special contexts, the OS otherwise.
    pub fn msleep(&self, ms: u32) {
        match &self.kind {
            SemaKind::Os(_) => std::thread::sleep(Duration::from_millis(u64::from(ms))),
            SemaKind::Backend { backend, .. } => backend.sleep_ms(ms),
        }
    }
}

impl Default for Sema {
    fn default() -> Self {
        Sema::new()
    }
}
