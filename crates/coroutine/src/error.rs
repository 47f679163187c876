// SPDX-License-Identifier: Apache-2.0

//! Errors for the coroutine scheduler.
//!
//! Important note: coroutine errors cross worker threads freely, so every
//! variant stays `Send + Sync`.

/// Errors that can occur in the coroutine scheduler.
#[derive(thiserror::Error, Debug)]
pub enum CoroutineError {
    /// The task pool stayed exhausted through the allocation backoff.
    #[error("lightweight task pool exhausted")]
    TasksExhausted,

    /// The operation is only valid from inside a coroutine.
    #[error("not running inside a coroutine")]
    NotACoroutine,

    /// A semaphore wait was attempted by a task other than its owner.
    #[error("coroutine semaphore waited on by a foreign task")]
    NotOwner,

    /// A semaphore wait was cut short by scheduler shutdown; callers must
    /// treat this as a cancellation signal and unwind.
    #[error("woken by scheduler shutdown")]
    Shutdown,

    /// The semaphore still has a pending pairing and cannot be closed.
    #[error("coroutine semaphore is still in use")]
    SemInUse,

    /// The requested worker index does not exist.
    #[error("worker {worker} out of range ({count} workers)")]
    WorkerOutOfRange {
        /// Requested worker index.
        worker: usize,
        /// Number of workers in the manager.
        count: usize,
    },

    /// A supporting thread could not be created.
    #[error(transparent)]
    Thread(#[from] corun_threading::Error),
}
