//! Error types for vc-jukebox
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

use crate::resolver::ResolveError;

/// Main error type for vc-jukebox
///
/// Validation errors (`QueueFull`, `DurationExceeded`, `InvalidVolume`) are
/// returned synchronously to the triggering command and never mutate session
/// state. Resolution and transport failures are handled inside the session
/// state machine and surfaced as notifications instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Queue has reached its configured size bound
    #[error("queue is full ({limit} tracks max)")]
    QueueFull { limit: usize },

    /// Track duration exceeds the configured cap
    #[error("track duration {actual}s exceeds the {limit}s limit")]
    DurationExceeded { actual: u64, limit: u64 },

    /// Volume outside the accepted 1-200 range
    #[error("volume {0} is out of range (1-200)")]
    InvalidVolume(u16),

    /// Registry removal attempted on a session that has not stopped
    #[error("session is still active")]
    SessionBusy,

    /// Fetch pool admission queue is full
    #[error("fetch pool is saturated, try again later")]
    PoolSaturated,

    /// Session task has shut down and no longer accepts commands
    #[error("session has shut down")]
    SessionClosed,

    /// Operation not valid in the session's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration file loading errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Source resolution errors
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Voice transport errors
    #[error("transport failure: {0}")]
    Transport(String),

    /// File I/O errors
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the vc-jukebox Error
pub type Result<T> = std::result::Result<T, Error>;
