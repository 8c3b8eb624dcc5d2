//! Host side of the Embedded Sass Protocol transport.
//!
//! One compiler subprocess serves many concurrent compilations. Frames on
//! its stdin and stdout carry a varint length, a varint correlation id and a
//! payload; this crate owns everything about those frames and nothing about
//! the payload schema, which callers supply through [`Envelope`] and
//! [`CallHandler`].
//!
//! The layers, bottom up:
//!
//! - [`Connection`] spawns the compiler, writes frames, and reads them on a
//!   background thread.
//! - [`Dispatcher`] allocates correlation ids and routes each inbound frame
//!   to the session owning its id. Id `0` is routed by the id embedded in the
//!   payload; id `0xFFFFFFFF` fails every session.
//! - [`session`] turns a registration into a blocking call and serves the
//!   compiler's nested requests while the call is in flight.
//! - [`ResilientDispatcher`] replaces a dispatcher that has died or run out
//!   of ids, so new calls keep working.
//! - [`Compiler`] bundles all of the above behind `call` and `close`.
//!
//! A process that forks while a compiler is running should share a
//! [`ForkRegistry`] with every compiler and call its hooks around `fork`, so
//! the child never touches the parent's pipes.

mod channel;
mod compiler;
mod connection;
mod dispatcher;
mod error;
#[cfg(unix)]
mod fork;
pub mod frame;
mod message;
mod pending;
mod resilient;
pub mod session;
pub mod telemetry;
pub mod varint;

#[cfg(test)]
mod tests;

pub use channel::{Channel, Subscription};
pub use compiler::Compiler;
pub use connection::{Connection, FrameSink};
pub use dispatcher::{Dispatcher, Reply, SessionSink};
pub use error::{CallbackError, HostError, MessageError, TransportError};
#[cfg(unix)]
pub use fork::{ForkAware, ForkGuard, ForkRegistry};
pub use frame::{ENVELOPE_ID, FATAL_ID, FIRST_SESSION_ID, Frame, LAST_SESSION_ID, Route};
pub use message::{
    CallHandler, Envelope, Inbound, LogEvent, LogKind, NestedKind, NestedRequest, Outgoing,
};
pub use pending::{Pending, Resolver, pair};
pub use resilient::{DispatcherFactory, ResilientDispatcher};
pub use session::Call;
pub use telemetry::{TelemetryError, TelemetryHandle};
