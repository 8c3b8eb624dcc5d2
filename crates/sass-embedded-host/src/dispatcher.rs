//! Multiplexes sessions over one compiler connection.
//!
//! A [`Dispatcher`] hands out correlation ids, routes every inbound frame to
//! the session registered under its id, and converts a connection failure
//! into an error delivered to every session subscribed at that moment. Its
//! registry lock covers bookkeeping only; it is never held across I/O or a
//! session callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;

use sass_embedded_config::CompilerCommand;
use tracing::{debug, warn};

use crate::connection::{Connection, FrameSink};
use crate::error::HostError;
use crate::frame::{FIRST_SESSION_ID, Frame, LAST_SESSION_ID, Route};
use crate::message::Envelope;

/// Log target for dispatcher operations.
pub(crate) const DISPATCHER_TARGET: &str = "sass_embedded_host::dispatcher";

/// Receives everything addressed to one session.
pub trait SessionSink: Send + Sync {
    /// Called on the reader thread for each payload routed to the session.
    ///
    /// Implementations must return quickly; slow work belongs on another
    /// thread, answering through `reply`.
    fn on_payload(&self, payload: Vec<u8>, reply: Reply);

    /// Called when the connection fails or the dispatcher is closed.
    fn on_fatal(&self, error: HostError);
}

/// Send handle bound to one session's id.
#[derive(Clone)]
pub struct Reply {
    dispatcher: Weak<Dispatcher>,
    session: Arc<dyn SessionSink>,
    id: u32,
}

impl Reply {
    /// Correlation id this handle sends under.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Sends `payload` tagged with the session's id.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Closed`] if the dispatcher is gone, or the
    /// transport error if the write fails.
    pub fn send(&self, payload: &[u8]) -> Result<(), HostError> {
        let dispatcher = self.dispatcher.upgrade().ok_or(HostError::Closed)?;
        dispatcher.send(self.id, payload)
    }

    /// Unregisters the session once it has seen its terminal message, so
    /// later frames for the id are dropped by the dispatcher.
    pub fn finish(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.release(self.id, &self.session);
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").field("id", &self.id).finish()
    }
}

struct Registry {
    next_id: u32,
    sessions: HashMap<u32, Arc<dyn SessionSink>>,
    poisoned: bool,
}

/// One compiler generation: a connection plus the sessions using it.
pub struct Dispatcher {
    this: Weak<Self>,
    connection: Connection,
    envelope: Arc<dyn Envelope>,
    registry: Mutex<Registry>,
}

impl Dispatcher {
    /// Spawns a compiler and starts dispatching its frames.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the compiler cannot be started.
    pub fn spawn(
        command: &CompilerCommand,
        envelope: Arc<dyn Envelope>,
    ) -> Result<Arc<Self>, HostError> {
        let connection = Connection::spawn(command)?;
        Self::with_connection(connection, envelope)
    }

    /// Takes ownership of a spawned connection and starts its reader.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Transport`] if the reader cannot be started.
    pub fn with_connection(
        connection: Connection,
        envelope: Arc<dyn Envelope>,
    ) -> Result<Arc<Self>, HostError> {
        let dispatcher = Arc::new_cyclic(|this| Self {
            this: Weak::clone(this),
            connection,
            envelope,
            registry: Mutex::new(Registry {
                next_id: FIRST_SESSION_ID,
                sessions: HashMap::new(),
                poisoned: false,
            }),
        });
        let sink: Weak<dyn FrameSink> = Arc::downgrade(&dispatcher) as Weak<dyn FrameSink>;
        dispatcher.connection.start(sink)?;
        Ok(dispatcher)
    }

    /// Registers a session and returns its id.
    ///
    /// Ids are handed out in increasing order. Once the allocator passes the
    /// last session id it resets to the first as soon as no session is
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Closed`] once the dispatcher has failed or been
    /// closed, and [`HostError::IdSpaceExhausted`] when the allocator is at
    /// its ceiling while sessions are still registered.
    pub fn subscribe(&self, session: Arc<dyn SessionSink>) -> Result<u32, HostError> {
        if self.connection.is_closed() {
            return Err(HostError::Closed);
        }

        let mut registry = self.lock();
        if registry.poisoned {
            return Err(HostError::Closed);
        }
        if registry.next_id > LAST_SESSION_ID {
            if !registry.sessions.is_empty() {
                return Err(HostError::IdSpaceExhausted);
            }
            registry.next_id = FIRST_SESSION_ID;
        }

        let id = registry.next_id;
        registry.next_id = id + 1;
        registry.sessions.insert(id, session);
        drop(registry);

        debug!(
            target: DISPATCHER_TARGET,
            pid = self.connection.pid(),
            id,
            "session subscribed"
        );
        Ok(id)
    }

    /// Removes a session. Unknown ids are ignored, which includes every id
    /// once the dispatcher has failed.
    pub fn unsubscribe(&self, id: u32) {
        self.remove(id, |_| true);
    }

    /// Removes `id` only while it is still held by `session`. A handle that
    /// outlives its registration cannot evict a recycled id.
    pub(crate) fn release(&self, id: u32, session: &Arc<dyn SessionSink>) {
        self.remove(id, |registered| Arc::ptr_eq(registered, session));
    }

    fn remove(&self, id: u32, owned: impl FnOnce(&Arc<dyn SessionSink>) -> bool) {
        let mut registry = self.lock();
        if !registry.sessions.get(&id).is_some_and(owned) {
            return;
        }
        registry.sessions.remove(&id);
        if registry.sessions.is_empty() && registry.next_id > LAST_SESSION_ID {
            registry.next_id = FIRST_SESSION_ID;
        }
        drop(registry);

        debug!(
            target: DISPATCHER_TARGET,
            pid = self.connection.pid(),
            id,
            "session unsubscribed"
        );
    }

    /// Sends a payload under `id`.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write fails.
    pub fn send(&self, id: u32, payload: &[u8]) -> Result<(), HostError> {
        self.connection.write(id, payload)
    }

    /// Fails every registered session and shuts the compiler down.
    pub fn close(&self) {
        let sessions = self.poison();
        debug!(
            target: DISPATCHER_TARGET,
            pid = self.connection.pid(),
            sessions = sessions.as_ref().map_or(0, Vec::len),
            "closing dispatcher"
        );
        self.connection.close();
        for session in sessions.into_iter().flatten() {
            session.on_fatal(HostError::Closed);
        }
    }

    /// Returns `true` once the dispatcher has failed or been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed() || self.lock().poisoned
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// The underlying connection.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Marks the dispatcher poisoned and unregisters every session, returning
    /// them, or `None` if it was already poisoned.
    fn poison(&self) -> Option<Vec<Arc<dyn SessionSink>>> {
        let mut registry = self.lock();
        if registry.poisoned {
            return None;
        }
        registry.poisoned = true;
        Some(
            registry
                .sessions
                .drain()
                .map(|(_, session)| session)
                .collect(),
        )
    }

    fn deliver(&self, id: u32, payload: Vec<u8>) {
        let session = self.lock().sessions.get(&id).cloned();
        match session {
            Some(session) => {
                let reply = Reply {
                    dispatcher: Weak::clone(&self.this),
                    session: Arc::clone(&session),
                    id,
                };
                session.on_payload(payload, reply);
            }
            None => warn!(
                target: DISPATCHER_TARGET,
                pid = self.connection.pid(),
                id,
                bytes = payload.len(),
                "dropping frame for unknown session"
            ),
        }
    }

    /// Closes the connection off the calling thread, which may be the frame
    /// reader: a writer blocked on a full stdin pipe holds the write lock
    /// until the reader drains stdout again.
    fn close_connection_later(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let pid = self.connection.pid();
        let spawned = thread::Builder::new()
            .name(format!("sass-close-{pid}"))
            .spawn(move || this.connection.close());
        if let Err(error) = spawned {
            debug!(
                target: DISPATCHER_TARGET,
                pid,
                error = %error,
                "closing connection inline"
            );
            self.connection.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, id: u32) {
        self.lock().next_id = id;
    }
}

impl FrameSink for Dispatcher {
    fn on_frame(&self, frame: Frame) {
        let Frame { id, payload } = frame;
        match Route::of(id) {
            Route::Session(id) => self.deliver(id, payload),
            Route::Envelope => match self.envelope.correlation_id(&payload) {
                Ok(id) => self.deliver(id, payload),
                Err(error) => self.on_fatal(HostError::Protocol {
                    message: format!("undecodable envelope message: {error}"),
                }),
            },
            Route::Fatal => {
                let message = self.envelope.fatal_message(&payload);
                warn!(
                    target: DISPATCHER_TARGET,
                    pid = self.connection.pid(),
                    message = %message,
                    "compiler reported a fatal protocol error"
                );
                self.on_fatal(HostError::Protocol { message });
            }
        }
    }

    fn on_fatal(&self, error: HostError) {
        let Some(sessions) = self.poison() else {
            debug!(
                target: DISPATCHER_TARGET,
                pid = self.connection.pid(),
                error = %error,
                "ignoring failure on closed dispatcher"
            );
            return;
        };

        warn!(
            target: DISPATCHER_TARGET,
            pid = self.connection.pid(),
            sessions = sessions.len(),
            error = %error,
            "compiler connection failed"
        );
        for session in sessions {
            session.on_fatal(error.clone());
        }
        self.close_connection_later();
    }
}

#[cfg(unix)]
impl crate::fork::ForkAware for Dispatcher {
    fn detach_in_child(&self, null: std::os::fd::BorrowedFd<'_>) -> nix::Result<()> {
        self.connection.detach_in_child(null)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("Dispatcher")
            .field("connection", &self.connection)
            .field("next_id", &registry.next_id)
            .field("sessions", &registry.sessions.len())
            .field("poisoned", &registry.poisoned)
            .finish()
    }
}
