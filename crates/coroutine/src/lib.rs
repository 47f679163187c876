// SPDX-License-Identifier: Apache-2.0

//! M:N cooperative scheduler: lightweight tasks (LWTs) multiplexed onto a
//! fixed set of dedicated worker threads.
//!
//! Every spawned task is bound to one worker for its whole life and only
//! leaves the CPU at explicit suspension points: [`yield_now`],
//! [`sleep_ms`] and [`CoSem::down`]. Workers drain a locked FIFO ready
//! queue and poll each task with a waker that re-enqueues it on its own
//! worker, so a task is never in two places at once: it is either running,
//! on its worker's ready queue, parked in a semaphore's wait queue, or in
//! the manager's sleeper list.

pub mod cosem;
pub mod error;
pub mod manager;
pub mod ops;

mod backend;
mod costat;
mod lwt;
mod sleeper;
mod stats;
mod worker;

pub use cosem::CoSem;
pub use error::CoroutineError;
pub use lwt::is_coroutine;
pub use manager::CoroutineManager;
pub use ops::{sleep_ms, yield_now};
