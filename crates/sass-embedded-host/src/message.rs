//! Seams to the protocol message schema.
//!
//! The transport never interprets payload bytes itself. Whatever owns the
//! message schema plugs in here: [`Envelope`] answers the two questions the
//! dispatcher has to ask of a payload, and a [`CallHandler`] drives one
//! session from its initial request to its terminal response.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{CallbackError, MessageError};

/// Log target for messages forwarded from the compiler.
pub(crate) const COMPILER_LOG_TARGET: &str = "sass_embedded_host::compiler_log";

/// Connection-wide view of payloads, independent of any single session.
pub trait Envelope: Send + Sync + 'static {
    /// Extracts the correlation id carried inside a wire-id-0 payload.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the payload cannot be decoded.
    fn correlation_id(&self, payload: &[u8]) -> Result<u32, MessageError>;

    /// Extracts a readable message from a fatal protocol error payload.
    fn fatal_message(&self, payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}

/// Where the initial request of a session is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Sent under the session's own wire id.
    Addressed(Vec<u8>),
    /// Sent under wire id 0; the payload embeds the session id itself.
    Envelope(Vec<u8>),
}

/// Compiler-initiated request kinds that expect a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NestedKind {
    /// Resolve a URL to its canonical form.
    Canonicalize,
    /// Load the contents of a canonical URL.
    Import,
    /// Resolve a URL to a file on disk.
    FileImport,
    /// Invoke a host-defined function.
    FunctionCall,
}

impl fmt::Display for NestedKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Canonicalize => "canonicalize",
            Self::Import => "import",
            Self::FileImport => "file_import",
            Self::FunctionCall => "function_call",
        };
        formatter.write_str(label)
    }
}

/// A request the compiler sends while a session is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedRequest {
    /// What the compiler is asking for.
    pub kind: NestedKind,
    /// Request id the response must echo back.
    pub request_id: u32,
    /// Undecoded request body.
    pub body: Vec<u8>,
}

/// Severity of a compiler log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// A user-facing warning.
    Warning,
    /// A deprecation notice.
    Deprecation,
    /// Output of `@debug`.
    Debug,
}

/// A diagnostic the compiler emits during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Severity.
    pub kind: LogKind,
    /// Formatted message.
    pub message: String,
}

/// Decoded form of a payload addressed to a session.
#[derive(Debug)]
pub enum Inbound<T> {
    /// Terminal success; the session ends.
    Response(T),
    /// Terminal failure reported by the compiler; the session ends.
    Failed(String),
    /// Nested request; a response must be sent under the same id.
    Request(NestedRequest),
    /// Diagnostic; no response is sent.
    Log(LogEvent),
}

/// Drives one session: builds its request, decodes what comes back, and
/// serves the compiler's nested requests.
///
/// Handlers are shared with worker threads, so every method takes `&self`.
pub trait CallHandler: Send + Sync + 'static {
    /// Value a successful call resolves to.
    type Output: Send + 'static;

    /// Builds the initial request once the session's id is known.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the request cannot be encoded.
    fn request(&self, id: u32) -> Result<Outgoing, MessageError>;

    /// Decodes a payload delivered to this session.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the payload is not understood.
    fn decode(&self, payload: &[u8]) -> Result<Inbound<Self::Output>, MessageError>;

    /// Serves a nested request, returning the encoded response.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError`] if the host cannot satisfy the request; the
    /// session then replies with [`CallHandler::respond_error`] instead.
    fn respond(&self, request: &NestedRequest) -> Result<Vec<u8>, CallbackError>;

    /// Encodes the error response for a nested request that failed.
    fn respond_error(&self, request: &NestedRequest, error: &CallbackError) -> Vec<u8>;

    /// Receives a compiler log event.
    fn log(&self, event: LogEvent) {
        match event.kind {
            LogKind::Warning | LogKind::Deprecation => warn!(
                target: COMPILER_LOG_TARGET,
                kind = ?event.kind,
                "{}",
                event.message
            ),
            LogKind::Debug => debug!(target: COMPILER_LOG_TARGET, "{}", event.message),
        }
    }
}
