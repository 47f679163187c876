// SPDX-License-Identifier: Apache-2.0

//! Errors for the command registry.

/// Errors that can occur while registering diagnostic commands.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A command with the same (case-insensitive) name already exists.
    #[error("command `{name}` is already registered")]
    Duplicate {
        /// The conflicting command name.
        name: String,
    },

    /// The name `help` is reserved for the registry itself.
    #[error("command name `help` is reserved")]
    Reserved,
}
