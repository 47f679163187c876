// SPDX-License-Identifier: Apache-2.0

//! corun: a concurrency and caching runtime.
//!
//! The workspace combines three cores — an M:N cooperative coroutine
//! scheduler ([`coroutine`]), a bitmap-backed bounded slot pool
//! ([`bitmap`]) and a bounded self-evicting keyed cache ([`mcache`]) —
//! with the runtime primitives that support them: a thread pool, a
//! periodic timer, a pluggable semaphore abstraction ([`threading`]) and
//! an in-process diagnostic command registry ([`admin`]).

pub use corun_admin as admin;
pub use corun_bitmap as bitmap;
pub use corun_coroutine as coroutine;
pub use corun_mcache as mcache;
pub use corun_threading as threading;

pub use corun_admin::Printer;
pub use corun_bitmap::{Bitmap, SlotPool};
pub use corun_coroutine::{CoSem, CoroutineManager, sleep_ms, yield_now};
pub use corun_mcache::{Cache, CacheHooks};
pub use corun_threading::{RawThread, Sema, Stimer, TaskDriver, TaskJob, ThreadPool};
