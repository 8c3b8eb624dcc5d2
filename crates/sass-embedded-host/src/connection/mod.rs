//! Compiler subprocess and frame-level I/O over its stdio.
//!
//! A [`Connection`] owns the compiler's pipes. Writes are serialised by a
//! single lock so frames from concurrent sessions never interleave. Once
//! started, one background thread decodes frames from stdout and hands them
//! to a [`FrameSink`]; a second forwards stderr lines to the log.

mod lifecycle;

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::thread;

use sass_embedded_config::CompilerCommand;
use tracing::{debug, trace, warn};

use crate::error::{HostError, TransportError};
use crate::frame::{self, Frame};

/// Log target for connection operations.
pub(crate) const CONNECTION_TARGET: &str = "sass_embedded_host::connection";

/// Log target for lines the compiler writes to its stderr.
pub(crate) const COMPILER_STDERR_TARGET: &str = "sass_embedded_host::compiler_stderr";

/// Receives what the frame reader produces.
pub trait FrameSink: Send + Sync {
    /// Called once per decoded frame, in wire order, on the reader thread.
    fn on_frame(&self, frame: Frame);

    /// Called when the connection fails. May be called more than once.
    fn on_fatal(&self, error: HostError);
}

/// A running compiler process and its framed stdio.
pub struct Connection {
    command: String,
    pid: u32,
    owner_pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    stdin_open: AtomicBool,
    #[cfg(unix)]
    stdin_fd: std::os::fd::RawFd,
    stdout: Arc<File>,
    stderr: Arc<File>,
    child: Mutex<Child>,
    sink: OnceLock<Weak<dyn FrameSink>>,
    detached: AtomicBool,
}

impl Connection {
    /// Spawns the compiler with piped stdio.
    ///
    /// The process is running when this returns, but nothing reads its
    /// output until [`Connection::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Spawn`] if the process cannot be started.
    pub fn spawn(command: &CompilerCommand) -> Result<Self, HostError> {
        let rendered = command.display();
        debug!(
            target: CONNECTION_TARGET,
            command = %rendered,
            "spawning compiler process"
        );

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.working_dir {
            process.current_dir(dir);
        }

        let mut child = process.spawn().map_err(|source| HostError::Spawn {
            command: rendered.clone(),
            source: Arc::new(source),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            drop(child.kill());
            drop(child.wait());
            return Err(HostError::Spawn {
                command: rendered,
                source: Arc::new(io::Error::other("failed to capture compiler stdio")),
            });
        };

        let pid = child.id();
        debug!(
            target: CONNECTION_TARGET,
            pid,
            "compiler process spawned"
        );

        Ok(Self {
            command: rendered,
            pid,
            owner_pid: std::process::id(),
            #[cfg(unix)]
            stdin_fd: std::os::fd::AsRawFd::as_raw_fd(&stdin),
            stdin: Mutex::new(Some(stdin)),
            stdin_open: AtomicBool::new(true),
            stdout: Arc::new(into_file(stdout)),
            stderr: Arc::new(into_file(stderr)),
            child: Mutex::new(child),
            sink: OnceLock::new(),
            detached: AtomicBool::new(false),
        })
    }

    /// Starts the stdout frame reader and the stderr forwarder.
    ///
    /// The reader holds only a weak reference to `sink` and stops once the
    /// sink is dropped or the stream fails. Calling this twice has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Transport`] if a reader thread cannot be spawned.
    pub fn start(&self, sink: Weak<dyn FrameSink>) -> Result<(), HostError> {
        if self.sink.set(Weak::clone(&sink)).is_err() {
            return Ok(());
        }
        let pid = self.pid;

        let stdout = Arc::clone(&self.stdout);
        thread::Builder::new()
            .name(format!("sass-frames-{pid}"))
            .spawn(move || read_frames(&stdout, &sink, pid))
            .map_err(TransportError::Io)?;

        let stderr = Arc::clone(&self.stderr);
        thread::Builder::new()
            .name(format!("sass-stderr-{pid}"))
            .spawn(move || forward_stderr(&stderr, pid))
            .map_err(TransportError::Io)?;

        Ok(())
    }

    /// Writes one frame atomically with respect to other writers.
    ///
    /// A failed write is also reported to the sink as a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Transport`] if stdin is closed or the write fails.
    pub fn write(&self, id: u32, payload: &[u8]) -> Result<(), HostError> {
        if self.is_detached() {
            return Err(TransportError::NotConnected.into());
        }

        let result = {
            let mut guard = self.lock_stdin();
            let Some(stdin) = guard.as_mut() else {
                return Err(TransportError::NotConnected.into());
            };
            frame::write(stdin, id, payload)
        };

        match result {
            Ok(()) => {
                trace!(
                    target: CONNECTION_TARGET,
                    pid = self.pid,
                    id,
                    bytes = payload.len(),
                    "frame written"
                );
                Ok(())
            }
            Err(error) => {
                let error = HostError::transport(error);
                warn!(
                    target: CONNECTION_TARGET,
                    pid = self.pid,
                    id,
                    error = %error,
                    "writing to compiler failed"
                );
                self.report_fatal(error.clone());
                Err(error)
            }
        }
    }

    /// Closes stdin and waits for the compiler to exit. Idempotent.
    pub fn close(&self) {
        if self.is_detached() {
            return;
        }

        let stdin = self.lock_stdin().take();
        self.stdin_open.store(false, Ordering::Release);
        if stdin.is_some() {
            debug!(
                target: CONNECTION_TARGET,
                pid = self.pid,
                "closing compiler stdin"
            );
        }
        drop(stdin);

        lifecycle::terminate_child(&mut self.lock_child());
    }

    /// Returns `true` once stdin is closed and the compiler has exited.
    ///
    /// Also `true` in a process other than the one that spawned the compiler.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        if self.is_detached() {
            return true;
        }
        if self.stdin_open.load(Ordering::Acquire) {
            return false;
        }
        lifecycle::has_exited(&mut self.lock_child())
    }

    /// Process id of the compiler.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire) || std::process::id() != self.owner_pid
    }

    fn report_fatal(&self, error: HostError) {
        if let Some(sink) = self.sink.get().and_then(Weak::upgrade) {
            sink.on_fatal(error);
        }
    }

    fn lock_stdin(&self) -> MutexGuard<'_, Option<ChildStdin>> {
        self.stdin
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(unix)]
impl crate::fork::ForkAware for Connection {
    fn detach_in_child(&self, null: std::os::fd::BorrowedFd<'_>) -> nix::Result<()> {
        use std::os::fd::AsRawFd;

        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // stdin's descriptor is released on close and may have been reused.
        let stdin = self
            .stdin_open
            .load(Ordering::Acquire)
            .then_some(self.stdin_fd);
        let targets = [
            Some(self.stdout.as_raw_fd()),
            Some(self.stderr.as_raw_fd()),
            stdin,
        ];
        for fd in targets.into_iter().flatten() {
            nix::unistd::dup2(null.as_raw_fd(), fd)?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("stdin_open", &self.stdin_open.load(Ordering::Relaxed))
            .field("detached", &self.detached.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn read_frames(stdout: &File, sink: &Weak<dyn FrameSink>, pid: u32) {
    let mut reader = BufReader::new(stdout);
    loop {
        let result = frame::read(&mut reader);
        let Some(sink) = sink.upgrade() else {
            debug!(
                target: CONNECTION_TARGET,
                pid,
                "frame sink dropped, stopping reader"
            );
            return;
        };
        match result {
            Ok(frame) => {
                trace!(
                    target: CONNECTION_TARGET,
                    pid,
                    id = frame.id,
                    bytes = frame.payload.len(),
                    "frame received"
                );
                sink.on_frame(frame);
            }
            Err(error) => {
                debug!(
                    target: CONNECTION_TARGET,
                    pid,
                    error = %error,
                    "frame reader stopped"
                );
                sink.on_fatal(HostError::transport(error));
                return;
            }
        }
    }
}

fn forward_stderr(stderr: &File, pid: u32) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(text) => warn!(target: COMPILER_STDERR_TARGET, pid, "{text}"),
            Err(error) => {
                debug!(
                    target: CONNECTION_TARGET,
                    pid,
                    error = %error,
                    "stopped reading compiler stderr"
                );
                return;
            }
        }
    }
}

#[cfg(unix)]
fn into_file(handle: impl Into<std::os::fd::OwnedFd>) -> File {
    File::from(handle.into())
}

#[cfg(windows)]
fn into_file(handle: impl Into<std::os::windows::io::OwnedHandle>) -> File {
    File::from(handle.into())
}
