//! A channel that replaces its dispatcher when the compiler goes away.
//!
//! Sessions are never migrated: callers already waiting on a failed
//! dispatcher see its error. Only new sessions land on the replacement, and
//! each `connect` retries at most once.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use sass_embedded_config::CompilerCommand;
use tracing::{debug, info};

use crate::channel::{Channel, Subscription};
use crate::dispatcher::{Dispatcher, SessionSink};
use crate::error::HostError;
#[cfg(unix)]
use crate::fork::{ForkAware, ForkRegistry};
use crate::message::Envelope;

const RESILIENT_TARGET: &str = "sass_embedded_host::resilient";

/// Spawns dispatchers for one compiler command.
#[derive(Clone)]
pub struct DispatcherFactory {
    command: CompilerCommand,
    envelope: Arc<dyn Envelope>,
    #[cfg(unix)]
    forks: Option<Arc<ForkRegistry>>,
}

impl DispatcherFactory {
    /// Creates a factory for `command`.
    #[must_use]
    pub fn new(command: CompilerCommand, envelope: Arc<dyn Envelope>) -> Self {
        Self {
            command,
            envelope,
            #[cfg(unix)]
            forks: None,
        }
    }

    /// Registers every dispatcher this factory spawns with `registry`.
    #[cfg(unix)]
    #[must_use]
    pub fn with_fork_registry(mut self, registry: Arc<ForkRegistry>) -> Self {
        self.forks = Some(registry);
        self
    }

    /// Command the factory launches.
    #[must_use]
    pub const fn command(&self) -> &CompilerCommand {
        &self.command
    }

    /// Spawns a compiler and wraps it in a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the compiler cannot be started.
    pub fn spawn(&self) -> Result<Arc<Dispatcher>, HostError> {
        let dispatcher = Dispatcher::spawn(&self.command, Arc::clone(&self.envelope))?;
        #[cfg(unix)]
        {
            if let Some(registry) = &self.forks {
                let entry: Arc<dyn ForkAware> = Arc::clone(&dispatcher) as Arc<dyn ForkAware>;
                registry.register(Arc::downgrade(&entry));
            }
        }
        info!(
            target: RESILIENT_TARGET,
            command = %self.command.display(),
            pid = dispatcher.connection().pid(),
            "compiler started"
        );
        Ok(dispatcher)
    }
}

impl fmt::Debug for DispatcherFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherFactory")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

/// Holds the current dispatcher and swaps it out after failures.
pub struct ResilientDispatcher {
    factory: DispatcherFactory,
    // `None` once closed by the caller.
    current: Mutex<Option<Arc<Dispatcher>>>,
}

impl ResilientDispatcher {
    /// Spawns the first compiler.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the compiler cannot be started.
    pub fn new(factory: DispatcherFactory) -> Result<Self, HostError> {
        let dispatcher = factory.spawn()?;
        Ok(Self {
            factory,
            current: Mutex::new(Some(dispatcher)),
        })
    }

    /// The dispatcher new sessions currently go to.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Closed`] after [`ResilientDispatcher::close`].
    pub fn current(&self) -> Result<Arc<Dispatcher>, HostError> {
        self.lock().clone().ok_or(HostError::Closed)
    }

    /// Closes the current dispatcher and stops spawning replacements.
    pub fn close(&self) {
        let dispatcher = self.lock().take();
        if let Some(dispatcher) = dispatcher {
            debug!(
                target: RESILIENT_TARGET,
                pid = dispatcher.connection().pid(),
                "closing compiler"
            );
            dispatcher.close();
        }
    }

    /// Returns `true` after [`ResilientDispatcher::close`], or while the
    /// current dispatcher is closed and not yet replaced.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock()
            .as_ref()
            .is_none_or(|dispatcher| dispatcher.is_closed())
    }

    /// Installs a fresh dispatcher unless `failed` was already replaced.
    fn replace(&self, failed: &Arc<Dispatcher>) -> Result<Arc<Dispatcher>, HostError> {
        let mut current = self.lock();
        let Some(installed) = current.as_ref() else {
            return Err(HostError::Closed);
        };
        if !Arc::ptr_eq(installed, failed) {
            return Ok(Arc::clone(installed));
        }

        let fresh = self.factory.spawn()?;
        let retired = current.replace(Arc::clone(&fresh));
        drop(current);

        if let Some(retired) = retired {
            info!(
                target: RESILIENT_TARGET,
                retired = retired.connection().pid(),
                pid = fresh.connection().pid(),
                "replaced compiler"
            );
        }
        Ok(fresh)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Dispatcher>>> {
        self.current
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Channel for ResilientDispatcher {
    fn connect(&self, session: Arc<dyn SessionSink>) -> Result<Subscription, HostError> {
        let dispatcher = self.current()?;
        match dispatcher.connect(Arc::clone(&session)) {
            Err(error) if error.is_recoverable() => {
                debug!(
                    target: RESILIENT_TARGET,
                    pid = dispatcher.connection().pid(),
                    error = %error,
                    "dispatcher refused session, spawning a replacement"
                );
                self.replace(&dispatcher)?.connect(session)
            }
            outcome => outcome,
        }
    }
}

impl Drop for ResilientDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ResilientDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientDispatcher")
            .field("factory", &self.factory)
            .field("current", &*self.lock())
            .finish()
    }
}
