//! Error types for UART54 link operations

use std::path::PathBuf;
use thiserror::Error;
use uart54_chip::CodecError;

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while driving a UART54 link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Physical register window could not be mapped; the channel is unusable
    #[error("Cannot map {len:#x} bytes at {phys:#x} via {}: {reason}", .path.display())]
    MapFailed {
        /// Memory device that was opened
        path: PathBuf,
        /// Physical address requested
        phys: u64,
        /// Length requested
        len: usize,
        /// Reason for failure
        reason: String,
    },

    /// Register access outside the mapped window
    #[error("Out of bounds access: offset={offset:#x}, size={size}, limit={limit:#x}")]
    OutOfBounds {
        /// Offset requested
        offset: usize,
        /// Access width in bytes
        size: usize,
        /// Mapped window length
        limit: usize,
    },

    /// A command field does not fit its bit width
    #[error("Invalid field: {0}")]
    InvalidField(#[source] CodecError),

    /// Parity or tag check failed while decoding a command word
    #[error("Malformed command word: {0}")]
    MalformedCommand(#[source] CodecError),

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms: {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Publish transport failure
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for failure
        reason: String,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {reason}")]
    Config {
        /// Reason for failure
        reason: String,
    },

    /// Channel letter or index not present on this link
    #[error("Unknown channel: {name}")]
    UnknownChannel {
        /// Name or index that was requested
        name: String,
    },

    /// Statistics counters are not wired for this channel
    #[error("Statistics counters not configured for channel {channel}")]
    StatsUnavailable {
        /// Channel letter
        channel: char,
    },

    /// Board-level request rejected before touching hardware
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Reason for rejection
        reason: String,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl LinkError {
    /// Create a map failed error
    pub fn map_failed(
        path: impl Into<PathBuf>,
        phys: u64,
        len: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::MapFailed {
            path: path.into(),
            phys,
            len,
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create an unknown channel error
    pub fn unknown_channel(name: impl Into<String>) -> Self {
        Self::UnknownChannel { name: name.into() }
    }

    /// Create an invalid request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<CodecError> for LinkError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::InvalidField { .. } => Self::InvalidField(err),
            CodecError::NotAConfigCommand { .. } | CodecError::ParityMismatch { .. } => {
                Self::MalformedCommand(err)
            }
        }
    }
}

/// Failure of a bounded [`send_word`](crate::RegisterChannel::send_word)
#[derive(Debug, Error)]
pub enum SendError {
    /// TX ready bit never asserted; nothing was written
    #[error("Transmitter not ready after {waited_ms}ms")]
    NotReady {
        /// How long the handshake waited
        waited_ms: u64,
    },

    /// Register access failed
    #[error(transparent)]
    Link(#[from] LinkError),
}
