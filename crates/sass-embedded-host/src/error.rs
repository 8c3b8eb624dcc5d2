//! Error types surfaced by the transport and session layers.
//!
//! [`HostError`] is what callers of the public surface see. It is `Clone`
//! because a single connection failure is delivered to every session that is
//! subscribed at the time; underlying I/O errors are wrapped in `Arc` for
//! that reason.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Wire-level failures raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The compiler closed its stdout between frames.
    #[error("compiler closed its output stream")]
    Closed,

    /// I/O error during read or write.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A varint did not fit in 32 bits.
    #[error("varint exceeds 32 bits")]
    VarintOverflow,

    /// A frame declared fewer bytes than its own id occupies.
    #[error("frame declares {declared} bytes but its id varint needs {id_len}")]
    LengthMismatch {
        /// Length announced by the frame header.
        declared: u32,
        /// Bytes taken by the id varint.
        id_len: usize,
    },

    /// The payload does not fit in a frame.
    #[error("payload of {len} bytes exceeds the frame size limit")]
    PayloadTooLarge {
        /// Payload size in bytes.
        len: usize,
    },

    /// The connection's stdin has already been closed.
    #[error("connection to the compiler is closed")]
    NotConnected,
}

/// Failure to encode or decode a protocol payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct MessageError {
    message: String,
}

impl MessageError {
    /// Creates an error with the supplied description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Failure raised by a host callback while serving a nested request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    /// Creates an error with the supplied description.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors returned by compiler calls and by the dispatch layer.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The compiler process could not be started.
    #[error("failed to spawn compiler `{command}`: {source}")]
    Spawn {
        /// Command line that was attempted.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The pipe to the compiler failed or carried a malformed frame.
    #[error("transport failure: {source}")]
    Transport {
        /// The underlying transport error.
        #[source]
        source: Arc<TransportError>,
    },

    /// The compiler reported a connection-wide protocol error.
    #[error("compiler reported a protocol error: {message}")]
    Protocol {
        /// Message supplied by the compiler.
        message: String,
    },

    /// Every correlation id is held by an active session.
    #[error("correlation id space exhausted")]
    IdSpaceExhausted,

    /// The dispatcher has failed or been closed and accepts no new sessions.
    #[error("dispatcher is closed")]
    Closed,

    /// A payload addressed to one session could not be decoded.
    #[error("failed to decode message for session {id}: {source}")]
    Decode {
        /// Correlation id of the session.
        id: u32,
        /// The decoding failure.
        #[source]
        source: MessageError,
    },

    /// The initial request for a session could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[source] MessageError),

    /// The compiler rejected this session's request.
    #[error("compilation failed: {message}")]
    Rejected {
        /// Message supplied by the compiler.
        message: String,
    },
}

impl HostError {
    /// Returns `true` when a fresh dispatcher may succeed where this one failed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::IdSpaceExhausted | Self::Closed)
    }

    pub(crate) fn transport(error: TransportError) -> Self {
        Self::Transport {
            source: Arc::new(error),
        }
    }
}

impl From<TransportError> for HostError {
    fn from(error: TransportError) -> Self {
        Self::transport(error)
    }
}
