//! Subscription handles binding a session to a dispatcher.

use std::fmt;
use std::sync::Arc;

use crate::dispatcher::{Dispatcher, SessionSink};
use crate::error::HostError;
use crate::frame::ENVELOPE_ID;
use crate::message::Outgoing;

/// Anything a session can be connected through.
pub trait Channel: Send + Sync {
    /// Registers `session` and returns the handle that owns its id.
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's refusal when no id can be allocated.
    fn connect(&self, session: Arc<dyn SessionSink>) -> Result<Subscription, HostError>;
}

impl Channel for Arc<Dispatcher> {
    fn connect(&self, session: Arc<dyn SessionSink>) -> Result<Subscription, HostError> {
        let id = self.subscribe(Arc::clone(&session))?;
        Ok(Subscription::new(Arc::clone(self), id, session))
    }
}

/// A session's registration with a dispatcher.
///
/// Dropping the subscription unsubscribes it, so the id is released exactly
/// once however the call path exits. The release is a no-op if the session
/// already finished and its id went to someone else.
pub struct Subscription {
    dispatcher: Arc<Dispatcher>,
    session: Arc<dyn SessionSink>,
    id: u32,
    active: bool,
}

impl Subscription {
    pub(crate) const fn new(
        dispatcher: Arc<Dispatcher>,
        id: u32,
        session: Arc<dyn SessionSink>,
    ) -> Self {
        Self {
            dispatcher,
            session,
            id,
            active: true,
        }
    }

    /// Correlation id owned by this subscription.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Dispatcher the session is registered with.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Sends a session's request.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the write fails.
    pub fn send(&self, outgoing: &Outgoing) -> Result<(), HostError> {
        match outgoing {
            Outgoing::Addressed(payload) => self.dispatcher.send(self.id, payload),
            Outgoing::Envelope(payload) => self.dispatcher.send(ENVELOPE_ID, payload),
        }
    }

    /// Unsubscribes now rather than on drop.
    pub fn disconnect(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            self.dispatcher.release(self.id, &self.session);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
