// SPDX-License-Identifier: Apache-2.0

//! Preemptive runtime primitives: raw service threads, a FIFO thread pool,
//! a periodic timer, a semaphore abstraction with a pluggable
//! coroutine-aware backend, and a bounded-concurrency task-set orchestrator.

pub mod error;
pub mod pool;
pub mod raw;
pub mod sema;
pub mod taskset;
pub mod timer;

mod tpstat;
mod wake;

pub use error::Error;
pub use pool::ThreadPool;
pub use raw::{RawHandle, RawService, RawThread};
pub use sema::{BackendSema, Sema, SemaBackend, register_backend};
pub use taskset::{TaskDriver, TaskJob, process};
pub use timer::{Sleeper, Stimer};
