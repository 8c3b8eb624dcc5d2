//! The entry point most hosts use.

use std::sync::Arc;

use sass_embedded_config::Config;
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::HostError;
#[cfg(unix)]
use crate::fork::ForkRegistry;
use crate::message::{CallHandler, Envelope};
use crate::resilient::{DispatcherFactory, ResilientDispatcher};
use crate::session::{self, Call};

const COMPILER_TARGET: &str = "sass_embedded_host::compiler";

/// A long-lived compiler shared by any number of threads.
///
/// Calls are multiplexed over one process. If that process dies or runs out
/// of correlation ids the next call transparently starts a replacement.
///
/// ```no_run
/// use sass_embedded_config::Config;
/// use sass_embedded_host::Compiler;
/// # use sass_embedded_host::{Envelope, MessageError};
/// # struct Proto;
/// # impl Envelope for Proto {
/// #     fn correlation_id(&self, _: &[u8]) -> Result<u32, MessageError> { Ok(1) }
/// # }
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let compiler = Compiler::new(&Config::from_env()?, Proto)?;
/// // compiler.call(handler)?;
/// compiler.close();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Compiler {
    channel: ResilientDispatcher,
}

impl Compiler {
    /// Starts the configured compiler.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the compiler cannot be started.
    pub fn new(config: &Config, envelope: impl Envelope) -> Result<Self, HostError> {
        Self::with_factory(DispatcherFactory::new(
            config.compiler.clone(),
            Arc::new(envelope),
        ))
    }

    /// Starts the configured compiler and registers every generation with
    /// `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the compiler cannot be started.
    #[cfg(unix)]
    pub fn with_fork_registry(
        config: &Config,
        envelope: impl Envelope,
        registry: Arc<ForkRegistry>,
    ) -> Result<Self, HostError> {
        Self::with_factory(
            DispatcherFactory::new(config.compiler.clone(), Arc::new(envelope))
                .with_fork_registry(registry),
        )
    }

    /// Starts a compiler from a prepared factory.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the compiler cannot be started.
    pub fn with_factory(factory: DispatcherFactory) -> Result<Self, HostError> {
        debug!(
            target: COMPILER_TARGET,
            command = %factory.command().display(),
            "starting compiler"
        );
        Ok(Self {
            channel: ResilientDispatcher::new(factory)?,
        })
    }

    /// Runs one call to completion on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session.
    pub fn call<H: CallHandler>(&self, handler: H) -> Result<H::Output, HostError> {
        session::call(&self.channel, handler)
    }

    /// Sends a call and returns without waiting for its result.
    ///
    /// # Errors
    ///
    /// Returns the error that prevented the request from being sent.
    pub fn start<H: CallHandler>(&self, handler: H) -> Result<Call<H::Output>, HostError> {
        session::start(&self.channel, handler)
    }

    /// The dispatcher serving new calls.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Closed`] after [`Compiler::close`].
    pub fn dispatcher(&self) -> Result<Arc<Dispatcher>, HostError> {
        self.channel.current()
    }

    /// Fails pending calls and shuts the compiler down. Later calls return
    /// [`HostError::Closed`].
    pub fn close(&self) {
        self.channel.close();
    }

    /// Returns `true` after [`Compiler::close`], and also while a crashed
    /// compiler is waiting for the next call to replace it.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}
