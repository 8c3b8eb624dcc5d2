//! Loopback compiler used by the unit and behaviour tests.
//!
//! `cat` echoes every frame verbatim, so whatever a session sends comes back
//! under the same id. The JSON messages below are shaped so each echoed
//! request decodes as the reply the test wants to see.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sass_embedded_config::CompilerCommand;
use serde::{Deserialize, Serialize};

use crate::error::{CallbackError, MessageError};
use crate::message::{
    CallHandler, Envelope, Inbound, LogEvent, LogKind, NestedKind, NestedRequest, Outgoing,
};

/// A compiler that answers every frame with itself.
pub(crate) fn echo_command() -> CompilerCommand {
    CompilerCommand::new("cat")
}

/// Sends `SIGKILL` to the compiler.
pub(crate) fn kill(pid: u32) {
    let target = Pid::from_raw(i32::try_from(pid).expect("pid fits in i32"));
    signal::kill(target, Signal::SIGKILL).expect("kill compiler");
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub(crate) fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never held");
        thread::sleep(Duration::from_millis(10));
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Wire {
    Compile { id: u32, body: String },
    Version { id: u32 },
    FunctionCall { request_id: u32, arg: String },
    FunctionResult { request_id: u32, value: String },
    FunctionError { request_id: u32, message: String },
    Log { message: String },
    Failed { message: String },
}

impl Wire {
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("wire message serialises")
    }
}

fn parse(payload: &[u8]) -> Result<Wire, MessageError> {
    serde_json::from_slice(payload).map_err(|error| MessageError::new(error.to_string()))
}

/// Pulls the session id out of echoed version requests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopbackEnvelope;

impl Envelope for LoopbackEnvelope {
    fn correlation_id(&self, payload: &[u8]) -> Result<u32, MessageError> {
        match parse(payload)? {
            Wire::Version { id } => Ok(id),
            other => Err(MessageError::new(format!(
                "unexpected envelope message: {other:?}"
            ))),
        }
    }
}

/// How the host answers a nested function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callback {
    Double,
    Fail,
    Panic,
}

#[derive(Debug, Clone)]
enum Script {
    Compile(String),
    Version,
    FunctionCall { arg: String, callback: Callback },
    Hold,
    Fail(String),
    Garbage,
}

/// Handler whose request determines what the echo turns into.
#[derive(Debug)]
pub(crate) struct LoopbackCall {
    script: Script,
    logs: Arc<Mutex<Vec<LogEvent>>>,
}

impl LoopbackCall {
    fn scripted(script: Script) -> Self {
        Self {
            script,
            logs: Arc::default(),
        }
    }

    /// Echo resolves with `body`.
    pub(crate) fn compile(body: &str) -> Self {
        Self::scripted(Script::Compile(body.to_owned()))
    }

    /// Travels under id 0 and resolves with `version:{id}`.
    pub(crate) fn version() -> Self {
        Self::scripted(Script::Version)
    }

    /// Echo is a nested function call; its answer resolves the session.
    pub(crate) fn function_call(arg: &str, callback: Callback) -> Self {
        Self::scripted(Script::FunctionCall {
            arg: arg.to_owned(),
            callback,
        })
    }

    /// Echo is a log event, so the session never completes on its own.
    pub(crate) fn hold() -> Self {
        Self::scripted(Script::Hold)
    }

    /// Echo is a compile failure.
    pub(crate) fn fail(message: &str) -> Self {
        Self::scripted(Script::Fail(message.to_owned()))
    }

    /// Echo cannot be decoded.
    pub(crate) fn garbage() -> Self {
        Self::scripted(Script::Garbage)
    }

    /// Log events received so far.
    pub(crate) fn logs(&self) -> Arc<Mutex<Vec<LogEvent>>> {
        Arc::clone(&self.logs)
    }
}

impl CallHandler for LoopbackCall {
    type Output = String;

    fn request(&self, id: u32) -> Result<Outgoing, MessageError> {
        let addressed = |wire: Wire| Ok(Outgoing::Addressed(wire.to_bytes()));
        match &self.script {
            Script::Compile(body) => addressed(Wire::Compile {
                id,
                body: body.clone(),
            }),
            Script::Version => Ok(Outgoing::Envelope(Wire::Version { id }.to_bytes())),
            Script::FunctionCall { arg, .. } => addressed(Wire::FunctionCall {
                request_id: id + 1000,
                arg: arg.clone(),
            }),
            Script::Hold => addressed(Wire::Log {
                message: String::from("holding"),
            }),
            Script::Fail(message) => addressed(Wire::Failed {
                message: message.clone(),
            }),
            Script::Garbage => Ok(Outgoing::Addressed(b"not json".to_vec())),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Inbound<String>, MessageError> {
        Ok(match parse(payload)? {
            Wire::Compile { body, .. } => Inbound::Response(body),
            Wire::Version { id } => Inbound::Response(format!("version:{id}")),
            Wire::FunctionCall { request_id, .. } => Inbound::Request(NestedRequest {
                kind: NestedKind::FunctionCall,
                request_id,
                body: payload.to_vec(),
            }),
            Wire::FunctionResult { value, .. } => Inbound::Response(value),
            Wire::FunctionError { message, .. } | Wire::Failed { message } => {
                Inbound::Failed(message)
            }
            Wire::Log { message } => Inbound::Log(LogEvent {
                kind: LogKind::Warning,
                message,
            }),
        })
    }

    fn respond(&self, request: &NestedRequest) -> Result<Vec<u8>, CallbackError> {
        let Script::FunctionCall { callback, .. } = &self.script else {
            return Err(CallbackError::new("no callbacks registered"));
        };
        let Ok(Wire::FunctionCall { request_id, arg }) = parse(&request.body) else {
            return Err(CallbackError::new("malformed function call"));
        };
        match callback {
            Callback::Double => Ok(Wire::FunctionResult {
                request_id,
                value: arg.repeat(2),
            }
            .to_bytes()),
            Callback::Fail => Err(CallbackError::new("function refused")),
            Callback::Panic => panic!("function exploded"),
        }
    }

    fn respond_error(&self, request: &NestedRequest, error: &CallbackError) -> Vec<u8> {
        Wire::FunctionError {
            request_id: request.request_id,
            message: error.message().to_owned(),
        }
        .to_bytes()
    }

    fn log(&self, event: LogEvent) {
        self.logs.lock().expect("logs lock").push(event);
    }
}
