//! Shared test fixtures and behaviour scenarios.

#[cfg(unix)]
pub(crate) mod support;
