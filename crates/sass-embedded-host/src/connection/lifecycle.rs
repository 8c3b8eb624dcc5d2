//! Termination of the compiler process.

use std::process::Child;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::CONNECTION_TARGET;

/// How long a compiler gets to exit on its own after stdin closes.
const GRACE_PERIOD: Duration = Duration::from_millis(200);

/// Polling step used while waiting out the grace period.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits for the compiler to exit after its stdin was closed, killing it if
/// it outlives the grace period.
pub(super) fn terminate_child(child: &mut Child) {
    let pid = child.id();
    match wait_with_grace(child) {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                target: CONNECTION_TARGET,
                pid,
                "compiler did not exit after stdin closed, killing it"
            );
            kill_and_reap(child);
        }
        Err(error) => {
            warn!(
                target: CONNECTION_TARGET,
                pid,
                error = %error,
                "failed to check compiler status, killing it"
            );
            kill_and_reap(child);
        }
    }
}

/// Returns whether the child has exited, without blocking.
pub(super) fn has_exited(child: &mut Child) -> bool {
    !matches!(child.try_wait(), Ok(None))
}

fn wait_with_grace(child: &mut Child) -> std::io::Result<bool> {
    let mut waited = Duration::ZERO;
    loop {
        if let Some(status) = child.try_wait()? {
            debug!(
                target: CONNECTION_TARGET,
                pid = child.id(),
                ?status,
                "compiler exited"
            );
            return Ok(true);
        }
        if waited >= GRACE_PERIOD {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL);
        waited += POLL_INTERVAL;
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(error) = child.kill() {
        debug!(
            target: CONNECTION_TARGET,
            pid = child.id(),
            error = %error,
            "kill failed"
        );
    }
    if let Err(error) = child.wait() {
        debug!(
            target: CONNECTION_TARGET,
            pid = child.id(),
            error = %error,
            "reaping compiler failed"
        );
    }
}
