//! Single-slot future used to block a caller until its session finishes.
//!
//! [`pair`] returns the waiting half and the resolving half. The first call
//! to [`Resolver::fulfil`] or [`Resolver::reject`] wins; later calls are
//! ignored and report `false`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::HostError;

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(HostError),
    Taken,
}

struct Slot<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn settle(&self, outcome: State<T>) -> bool {
        let mut state = self.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = outcome;
        drop(state);
        self.ready.notify_all();
        true
    }
}

/// Waiting half of a single-slot future.
pub struct Pending<T> {
    slot: Arc<Slot<T>>,
}

/// Resolving half of a single-slot future.
pub struct Resolver<T> {
    slot: Arc<Slot<T>>,
}

/// Creates a connected waiter and resolver.
#[must_use]
pub fn pair<T>() -> (Pending<T>, Resolver<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(State::Pending),
        ready: Condvar::new(),
    });
    (
        Pending {
            slot: Arc::clone(&slot),
        },
        Resolver { slot },
    )
}

impl<T> Pending<T> {
    /// Blocks until the slot is resolved and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the error the slot was rejected with.
    pub fn wait(self) -> Result<T, HostError> {
        let mut state = self.slot.lock();
        while matches!(*state, State::Pending) {
            state = self
                .slot
                .ready
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        take(&mut state)
    }

    /// Waits at most `timeout`, handing the waiter back if it elapses.
    ///
    /// The session keeps running after a timeout; nothing is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` when the timeout elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, HostError>, Self> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.wait());
        };
        let mut state = self.slot.lock();
        while matches!(*state, State::Pending) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                drop(state);
                return Err(self);
            }
            state = self
                .slot
                .ready
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poison| poison.into_inner().0);
        }
        Ok(take(&mut state))
    }

    /// Returns `true` once the slot has been resolved.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(*self.slot.lock(), State::Pending)
    }
}

impl<T> Resolver<T> {
    /// Returns `true` once the slot has been resolved.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(*self.slot.lock(), State::Pending)
    }

    /// Resolves the slot with a value. Returns `false` if already resolved.
    pub fn fulfil(&self, value: T) -> bool {
        self.slot.settle(State::Fulfilled(value))
    }

    /// Rejects the slot with an error. Returns `false` if already resolved.
    pub fn reject(&self, error: HostError) -> bool {
        self.slot.settle(State::Rejected(error))
    }
}

fn take<T>(state: &mut State<T>) -> Result<T, HostError> {
    match std::mem::replace(state, State::Taken) {
        State::Fulfilled(value) => Ok(value),
        State::Rejected(error) => Err(error),
        // `wait` consumes the waiter, so the slot is read at most once.
        State::Pending | State::Taken => Err(HostError::Closed),
    }
}
