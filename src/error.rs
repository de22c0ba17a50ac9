//! Crate-wide error types.
//!
//! Only failures that must stop the emulator are errors: a malformed
//! configuration file, unreadable/unwritable backing-store I/O, or a
//! backing-store record that violates the on-disk format. Program-level
//! failures (bad instruction semantics, rejected memory accesses) are
//! reported through `Option`/`bool` returns and end up in the owning
//! process's log instead.

use std::fmt;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EmuError>;

/// Fatal emulator errors.
#[derive(Debug)]
pub enum EmuError {
    /// Malformed configuration entry. Raised at load time.
    Config(String),
    /// Backing-store file could not be created, read or rewritten.
    Io(io::Error),
    /// A backing-store record violates the on-disk format. This means a
    /// data-model invariant is broken and the emulator must not continue.
    Corruption(String),
}

impl fmt::Display for EmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmuError::Config(msg) => write!(f, "configuration error: {msg}"),
            EmuError::Io(err) => write!(f, "backing store I/O error: {err}"),
            EmuError::Corruption(msg) => write!(f, "backing store corrupted: {msg}"),
        }
    }
}

impl std::error::Error for EmuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EmuError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EmuError {
    fn from(err: io::Error) -> Self {
        EmuError::Io(err)
    }
}
