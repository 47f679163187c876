// SPDX-License-Identifier: Apache-2.0

//! Errors for the threading primitives.

/// Errors that can occur in the threading layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Spawning an OS thread failed.
    #[error("failed to spawn thread `{thread_name}`: {source}")]
    ThreadSpawn {
        /// The name the thread would have carried.
        thread_name: String,
        /// The underlying OS error.
        source: std::io::Error,
    },

    /// A semaphore backend is already registered; the slot holds one entry.
    #[error("a semaphore backend is already registered")]
    BackendAlreadyRegistered,

    /// A backend semaphore wait was interrupted by runtime shutdown.
    #[error("semaphore wait aborted by shutdown")]
    Shutdown,
}
