//! Error types for PTY process operations

use std::io;
use thiserror::Error;

/// PTY process error type
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration was rejected before anything was allocated
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A device pair could not be allocated
    #[error("Failed to allocate PTY: {0}")]
    Allocation(#[source] io::Error),

    /// The native execute primitive failed
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Failed to get or set a window size
    #[error("Failed to set window size: {0}")]
    WindowSize(#[source] io::Error),

    /// Signal delivery failed for a reason other than a missing process
    #[error("Failed to deliver signal: {0}")]
    Signal(#[source] io::Error),

    /// The blocking wait on the child failed
    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    /// A stream could not be materialized
    #[error("Stream error: {0}")]
    Stream(#[from] io::Error),

    /// The call is not valid in the current lifecycle state
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }
}

/// Result type for PTY process operations
pub type Result<T> = std::result::Result<T, Error>;
