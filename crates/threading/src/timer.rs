// SPDX-License-Identifier: Apache-2.0

//! Periodic timer with a monotonic-clock sleeper.

use crate::error::Error;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct SleeperState {
    /// Cleared by `wakeup` to cut the current (or next) wait short.
    enable: bool,
    /// Whether a waiter is currently parked.
    idle: bool,
}

/// Interruptible monotonic-deadline wait.
///
/// A wakeup that lands while nobody is waiting is latched: the next wait
/// returns immediately and the caller re-arms with [`Sleeper::rearm`].
pub struct Sleeper {
    state: Mutex<SleeperState>,
    cv: Condvar,
}

impl Sleeper {
    /// New armed sleeper.
    pub fn new() -> Self {
        Sleeper {
            state: Mutex::new(SleeperState {
                enable: true,
                idle: true,
            }),
            cv: Condvar::new(),
        }
    }

    /// Block for `timeout_ms` milliseconds or until [`Sleeper::wakeup`].
    pub fn wait(&self, timeout_ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let mut state = self.state.lock();
        state.idle = false;
        while state.enable && Instant::now() < deadline {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.idle = true;
    }

    /// Cut the current wait short; latches if nobody is waiting.
    pub fn wakeup(&self) {
        let mut state = self.state.lock();
        state.enable = false;
        self.cv.notify_all();
    }

    /// Re-arm after a consumed wakeup.
    pub fn rearm(&self) {
        self.state.lock().enable = true;
    }
}

impl Default for Sleeper {
    fn default() -> Self {
        Sleeper::new()
    }
}

type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerCfg {
    cycle_ms: u32,
    callback: TimerCallback,
}

struct TimerShared {
    running: AtomicBool,
    sleeper: Sleeper,
    cfg: Mutex<TimerCfg>,
}

/// Periodic timer: a dedicated thread invoking a callback every cycle.
///
/// [`Stimer::wakeup`] forces an early tick; [`Stimer::modify`] swaps cycle
/// and callback on the fly. Dropping the timer stops and joins the thread.
pub struct Stimer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Stimer {
    /// Start a timer firing `callback` every `cycle_ms` milliseconds.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadSpawn`] if the timer thread cannot be started.
    pub fn new(
        name: impl Into<String>,
        cycle_ms: u32,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let name = name.into();
        let shared = Arc::new(TimerShared {
            running: AtomicBool::new(true),
            sleeper: Sleeper::new(),
            cfg: Mutex::new(TimerCfg {
                cycle_ms,
                callback: Arc::new(callback),
            }),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&thread_shared))
            .map_err(|source| Error::ThreadSpawn {
                thread_name: name.clone(),
                source,
            })?;

        Ok(Stimer {
            shared,
            handle: Some(handle),
            name,
        })
    }

    /// Replace the cycle and callback. Takes effect from the next tick.
    pub fn modify(&self, cycle_ms: u32, callback: impl Fn() + Send + Sync + 'static) {
        let mut cfg = self.shared.cfg.lock();
        cfg.cycle_ms = cycle_ms;
        cfg.callback = Arc::new(callback);
    }

    /// Force an early tick.
    pub fn wakeup(&self) {
        self.shared.sleeper.wakeup();
    }
}

impl Drop for Stimer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.sleeper.wakeup();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(timer = %self.name, "timer thread panicked");
            }
        }
    }
}

fn timer_loop(shared: &TimerShared) {
    while shared.running.load(Ordering::SeqCst) {
        let cycle = u64::from(shared.cfg.lock().cycle_ms);
        shared.sleeper.wait(cycle);
        shared.sleeper.rearm();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let callback = shared.cfg.lock().callback.clone();
        callback();
    }
}
