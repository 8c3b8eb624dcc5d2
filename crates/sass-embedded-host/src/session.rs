//! One logical compiler call and its nested exchanges.
//!
//! A session sends a single request under its id, then reacts to whatever
//! arrives for that id until a terminal response or a connection failure
//! resolves its [`Pending`] slot. Nested requests and log events are served
//! on their own threads so a slow host callback never stalls the frame
//! reader, and with it every other session. Those threads are
//! fire-and-forget: their only output is the response frame they send.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::{Channel, Subscription};
use crate::dispatcher::{Reply, SessionSink};
use crate::error::{CallbackError, HostError};
use crate::message::{CallHandler, Inbound, LogEvent, NestedRequest};
use crate::pending::{self, Pending, Resolver};

/// Log target for session operations.
pub(crate) const SESSION_TARGET: &str = "sass_embedded_host::session";

/// Dispatcher-facing side of a call.
struct Session<H: CallHandler> {
    handler: Arc<H>,
    resolver: Resolver<H::Output>,
}

#[derive(Clone)]
enum Nested {
    Request(NestedRequest),
    Log(LogEvent),
}

impl<H: CallHandler> Session<H> {
    fn spawn_nested(&self, nested: Nested, reply: &Reply) {
        let id = reply.id();
        let handler = Arc::clone(&self.handler);
        let job = {
            let work = nested.clone();
            let sender = reply.clone();
            move || serve(handler.as_ref(), work, &sender)
        };

        if let Err(error) = thread::Builder::new()
            .name(format!("sass-nested-{id}"))
            .spawn(job)
        {
            warn!(
                target: SESSION_TARGET,
                id,
                error = %error,
                "could not spawn worker, serving nested request on reader thread"
            );
            serve(self.handler.as_ref(), nested, reply);
        }
    }
}

impl<H: CallHandler> SessionSink for Session<H> {
    fn on_payload(&self, payload: Vec<u8>, reply: Reply) {
        if self.resolver.is_settled() {
            debug!(
                target: SESSION_TARGET,
                id = reply.id(),
                bytes = payload.len(),
                "dropping message for finished session"
            );
            return;
        }
        match self.handler.decode(&payload) {
            Ok(Inbound::Response(output)) => {
                debug!(target: SESSION_TARGET, id = reply.id(), "session completed");
                reply.finish();
                self.resolver.fulfil(output);
            }
            Ok(Inbound::Failed(message)) => {
                debug!(
                    target: SESSION_TARGET,
                    id = reply.id(),
                    message = %message,
                    "compiler rejected session"
                );
                reply.finish();
                self.resolver.reject(HostError::Rejected { message });
            }
            Ok(Inbound::Request(request)) => {
                self.spawn_nested(Nested::Request(request), &reply);
            }
            Ok(Inbound::Log(event)) => self.spawn_nested(Nested::Log(event), &reply),
            Err(source) => {
                warn!(
                    target: SESSION_TARGET,
                    id = reply.id(),
                    error = %source,
                    "undecodable message for session"
                );
                reply.finish();
                self.resolver.reject(HostError::Decode {
                    id: reply.id(),
                    source,
                });
            }
        }
    }

    fn on_fatal(&self, error: HostError) {
        self.resolver.reject(error);
    }
}

fn serve<H: CallHandler>(handler: &H, nested: Nested, reply: &Reply) {
    match nested {
        Nested::Log(event) => {
            if panic::catch_unwind(AssertUnwindSafe(|| handler.log(event))).is_err() {
                warn!(target: SESSION_TARGET, id = reply.id(), "log handler panicked");
            }
        }
        Nested::Request(request) => {
            let response = respond(handler, &request, reply.id());
            if let Err(error) = reply.send(&response) {
                debug!(
                    target: SESSION_TARGET,
                    id = reply.id(),
                    kind = %request.kind,
                    error = %error,
                    "dropping nested response"
                );
            }
        }
    }
}

fn respond<H: CallHandler>(handler: &H, request: &NestedRequest, id: u32) -> Vec<u8> {
    let error = match panic::catch_unwind(AssertUnwindSafe(|| handler.respond(request))) {
        Ok(Ok(response)) => return response,
        Ok(Err(error)) => error,
        Err(payload) => CallbackError::new(panic_message(payload.as_ref())),
    };
    debug!(
        target: SESSION_TARGET,
        id,
        kind = %request.kind,
        request_id = request.request_id,
        error = %error,
        "nested request failed"
    );
    handler.respond_error(request, &error)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("host callback panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("host callback panicked: {message}")
    } else {
        String::from("host callback panicked")
    }
}

/// A call in flight.
///
/// The id is released as soon as the terminal response arrives, or when the
/// call is dropped without waiting; anything the compiler still sends for it
/// is discarded.
pub struct Call<T> {
    pending: Pending<T>,
    subscription: Subscription,
}

impl<T> Call<T> {
    /// Correlation id of the session.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.subscription.id()
    }

    /// Returns `true` once the outcome is available without blocking.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.pending.is_settled()
    }

    /// Blocks until the compiler answers or the connection fails.
    ///
    /// # Errors
    ///
    /// Returns the error that rejected the session.
    pub fn wait(self) -> Result<T, HostError> {
        let Self {
            pending,
            subscription,
        } = self;
        let outcome = pending.wait();
        subscription.disconnect();
        outcome
    }

    /// Waits at most `timeout`. There is no per-session cancel: on timeout
    /// the call is handed back and keeps running.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` when the timeout elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, HostError>, Self> {
        let Self {
            pending,
            subscription,
        } = self;
        match pending.wait_timeout(timeout) {
            Ok(outcome) => {
                subscription.disconnect();
                Ok(outcome)
            }
            Err(unfinished) => Err(Self {
                pending: unfinished,
                subscription,
            }),
        }
    }
}

impl<T> fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id())
            .field("settled", &self.pending.is_settled())
            .finish()
    }
}

/// Opens a session on `channel` and sends its request.
///
/// # Errors
///
/// Returns the channel's refusal, [`HostError::Encode`] if the request
/// cannot be built, or the transport error if it cannot be sent.
pub fn start<C, H>(channel: &C, handler: H) -> Result<Call<H::Output>, HostError>
where
    C: Channel + ?Sized,
    H: CallHandler,
{
    let (pending, resolver) = pending::pair();
    let handler = Arc::new(handler);
    let session: Arc<dyn SessionSink> = Arc::new(Session {
        handler: Arc::clone(&handler),
        resolver,
    });

    let subscription = channel.connect(session)?;
    let request = handler
        .request(subscription.id())
        .map_err(HostError::Encode)?;
    subscription.send(&request)?;
    debug!(
        target: SESSION_TARGET,
        id = subscription.id(),
        "session request sent"
    );

    Ok(Call {
        pending,
        subscription,
    })
}

/// Runs one call to completion, blocking the calling thread.
///
/// # Errors
///
/// Returns whatever [`start`] or [`Call::wait`] returns.
pub fn call<C, H>(channel: &C, handler: H) -> Result<H::Output, HostError>
where
    C: Channel + ?Sized,
    H: CallHandler,
{
    start(channel, handler)?.wait()
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::error::TransportError;
    use crate::message::LogKind;
    use crate::tests::support::{
        Callback, LoopbackCall, LoopbackEnvelope, echo_command, eventually, kill,
    };

    #[fixture]
    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::spawn(&echo_command(), Arc::new(LoopbackEnvelope)).expect("spawn dispatcher")
    }

    #[rstest]
    fn addressed_request_resolves_with_its_response(dispatcher: Arc<Dispatcher>) {
        let output = call(&dispatcher, LoopbackCall::compile("req-1")).expect("call failed");

        assert_eq!(output, "req-1");
        assert_eq!(dispatcher.active_sessions(), 0);
    }

    #[rstest]
    fn terminal_response_releases_the_id_before_wait(dispatcher: Arc<Dispatcher>) {
        let pending = start(&dispatcher, LoopbackCall::compile("done")).expect("start");

        eventually(|| pending.is_settled());

        assert_eq!(dispatcher.active_sessions(), 0);
        assert_eq!(pending.wait().expect("call failed"), "done");
    }

    #[rstest]
    fn rejection_releases_the_id_before_wait(dispatcher: Arc<Dispatcher>) {
        let pending = start(&dispatcher, LoopbackCall::fail("Undefined mixin.")).expect("start");

        eventually(|| pending.is_settled());

        assert_eq!(dispatcher.active_sessions(), 0);
        assert!(matches!(pending.wait(), Err(HostError::Rejected { .. })));
    }

    #[rstest]
    fn envelope_request_is_routed_back_by_embedded_id(dispatcher: Arc<Dispatcher>) {
        let output = call(&dispatcher, LoopbackCall::version()).expect("call failed");

        assert_eq!(output, "version:1");
    }

    #[rstest]
    fn concurrent_sessions_never_cross_talk(dispatcher: Arc<Dispatcher>) {
        let workers: Vec<_> = (0..100)
            .map(|index| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    let body = format!("req-{index}");
                    (body.clone(), call(&dispatcher, LoopbackCall::compile(&body)))
                })
            })
            .collect();

        for worker in workers {
            let (expected, outcome) = worker.join().expect("worker panicked");
            assert_eq!(outcome.expect("call failed"), expected);
        }
        assert_eq!(dispatcher.active_sessions(), 0);
    }

    #[rstest]
    fn nested_request_is_answered_under_the_same_id(dispatcher: Arc<Dispatcher>) {
        let output = call(
            &dispatcher,
            LoopbackCall::function_call("ab", Callback::Double),
        )
        .expect("call failed");

        assert_eq!(output, "abab");
    }

    #[rstest]
    #[case(Callback::Fail)]
    #[case(Callback::Panic)]
    fn failing_callback_only_fails_its_own_session(
        dispatcher: Arc<Dispatcher>,
        #[case] behaviour: Callback,
    ) {
        let bystander = start(&dispatcher, LoopbackCall::hold()).expect("start bystander");

        let error = call(&dispatcher, LoopbackCall::function_call("x", behaviour))
            .expect_err("callback failure should surface");
        let healthy = call(&dispatcher, LoopbackCall::compile("after")).expect("call failed");

        assert!(matches!(error, HostError::Rejected { .. }));
        assert_eq!(healthy, "after");
        assert!(!dispatcher.is_closed());
        let Err(bystander) = bystander.wait_timeout(Duration::from_millis(50)) else {
            panic!("bystander should still be waiting");
        };
        drop(bystander);
    }

    #[rstest]
    fn log_events_reach_the_handler_without_ending_the_session(dispatcher: Arc<Dispatcher>) {
        let handler = LoopbackCall::hold();
        let logs = handler.logs();
        let pending = start(&dispatcher, handler).expect("start");

        let Err(pending) = pending.wait_timeout(Duration::from_millis(200)) else {
            panic!("log must not resolve the session");
        };
        assert_eq!(
            logs.lock().expect("logs lock").as_slice(),
            &[LogEvent {
                kind: LogKind::Warning,
                message: String::from("holding"),
            }]
        );
        drop(pending);
    }

    #[rstest]
    fn compiler_failure_rejects_the_session(dispatcher: Arc<Dispatcher>) {
        let error = call(&dispatcher, LoopbackCall::fail("Undefined variable."))
            .expect_err("call should fail");

        assert!(matches!(error, HostError::Rejected { message } if message == "Undefined variable."));
    }

    #[rstest]
    fn undecodable_payload_rejects_only_that_session(dispatcher: Arc<Dispatcher>) {
        let error = call(&dispatcher, LoopbackCall::garbage()).expect_err("call should fail");

        assert!(matches!(error, HostError::Decode { id: 1, .. }));
        assert_eq!(
            call(&dispatcher, LoopbackCall::compile("still fine")).expect("call failed"),
            "still fine"
        );
    }

    #[rstest]
    fn killing_the_compiler_rejects_every_open_session(dispatcher: Arc<Dispatcher>) {
        let calls: Vec<_> = (0..5)
            .map(|_| start(&dispatcher, LoopbackCall::hold()).expect("start"))
            .collect();

        kill(dispatcher.connection().pid());

        for pending in calls {
            let error = pending.wait().expect_err("session should fail");
            assert!(
                matches!(&error, HostError::Transport { source } if matches!(**source, TransportError::Closed)),
                "unexpected error: {error}"
            );
        }
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.active_sessions(), 0);
        eventually(|| dispatcher.connection().is_closed());
    }
}
