// SPDX-License-Identifier: Apache-2.0

//! Single service thread with wakeup-driven sleeping.

use crate::error::Error;
use crate::wake::Wakeup;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a sleeping service thread waits before re-checking its
/// `need_sleep` condition on its own.
const SLEEP_RECHECK: Duration = Duration::from_millis(100);

/// The service driven by a [`RawThread`].
///
/// The thread loops: while `need_sleep` holds it blocks on its wakeup
/// channel (re-checking every 100 ms), then calls `run` once and starts
/// over. `cleanup` runs exactly once, on the destroying thread, after the
/// service thread has been joined.
pub trait RawService: Send + Sync + 'static {
    /// One pass of service work.
    fn run(&self);

    /// Whether the thread should sleep instead of calling [`RawService::run`].
    fn need_sleep(&self) -> bool {
        false
    }

    /// Teardown hook, invoked after the service thread has exited.
    fn cleanup(&self) {}
}

struct RawInner {
    running: AtomicBool,
    wake: Wakeup,
}

/// Cloneable wakeup handle for a [`RawThread`], usable from any thread.
#[derive(Clone)]
pub struct RawHandle {
    inner: Arc<RawInner>,
}

impl RawHandle {
    /// Wake the service thread if it is sleeping.
    pub fn wakeup(&self) {
        self.inner.wake.post();
    }
}

/// A dedicated OS thread driving one [`RawService`].
///
/// Dropping the value stops the thread, joins it, and then runs the
/// service's `cleanup` on the current thread.
pub struct RawThread {
    inner: Arc<RawInner>,
    service: Arc<dyn RawService>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl RawThread {
    /// Spawn a named service thread.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadSpawn`] if the OS refuses the thread.
    pub fn spawn<S: RawService>(name: impl Into<String>, service: Arc<S>) -> Result<Self, Error> {
        let name = name.into();
        let inner = Arc::new(RawInner {
            running: AtomicBool::new(true),
            wake: Wakeup::new(),
        });

        let thread_inner = inner.clone();
        let thread_service: Arc<dyn RawService> = service.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || service_loop(&thread_inner, thread_service.as_ref()))
            .map_err(|source| Error::ThreadSpawn {
                thread_name: name.clone(),
                source,
            })?;

        Ok(RawThread {
            inner,
            service,
            handle: Some(handle),
            name,
        })
    }

    /// Wake the service thread if it is sleeping.
    pub fn wakeup(&self) {
        self.inner.wake.post();
    }

    /// A cloneable wakeup handle that outlives borrows of `self`.
    pub fn handle(&self) -> RawHandle {
        RawHandle {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for RawThread {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.post_force();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(thread = %self.name, "service thread panicked");
            }
        }

        self.service.cleanup();
    }
}

fn service_loop(inner: &RawInner, service: &dyn RawService) {
    while inner.running.load(Ordering::SeqCst) {
        while service.need_sleep() {
            let _ = inner.wake.wait_timeout(SLEEP_RECHECK);
            if !inner.running.load(Ordering::SeqCst) {
                return;
            }
        }

        service.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counter {
        runs: AtomicU32,
        armed: AtomicBool,
        cleaned: AtomicBool,
    }

    impl RawService for Counter {
        fn run(&self) {
            let _ = self.runs.fetch_add(1, Ordering::SeqCst);
            self.armed.store(false, Ordering::SeqCst);
        }

        fn need_sleep(&self) -> bool {
            !self.armed.load(Ordering::SeqCst)
        }

        fn cleanup(&self) {
            self.cleaned.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn runs_on_wakeup_and_cleans_up() {
        let svc = Arc::new(Counter {
            runs: AtomicU32::new(0),
            armed: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        });

        let thread = RawThread::spawn("rawTest", svc.clone()).expect("spawn");
        svc.armed.store(true, Ordering::SeqCst);
        thread.wakeup();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while svc.runs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(svc.runs.load(Ordering::SeqCst) >= 1);

        drop(thread);
        assert!(svc.cleaned.load(Ordering::SeqCst));
    }
}
