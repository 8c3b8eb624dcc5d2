//! Log subscriber for hosts without one of their own.
//!
//! Two kinds of events flow through `tracing` here. Transport events
//! (spawns, frames, id bookkeeping, restarts) are the host's own diagnostics
//! and follow the configured filter. Compiler output (stderr lines and the
//! `@warn`/`@debug` diagnostics a [`CallHandler`](crate::CallHandler) logs by
//! default) is what stylesheet authors need to see. It stays visible at
//! [`COMPILER_OUTPUT_LEVEL`] unless the filter names its targets explicitly.
//!
//! Stdout belongs to the compiler protocol, so every event goes to stderr.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use sass_embedded_config::{Config, LogFormat};
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;

use crate::connection::COMPILER_STDERR_TARGET;
use crate::message::COMPILER_LOG_TARGET;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Level compiler output is shown at when the filter does not mention it.
pub const COMPILER_OUTPUT_LEVEL: &str = "debug";

/// Targets carrying text produced by the compiler rather than the host.
const COMPILER_OUTPUT_TARGETS: [&str; 2] = [COMPILER_LOG_TARGET, COMPILER_STDERR_TARGET];

/// Proof that the global subscriber has been configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The configured log filter expression did not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Another global subscriber was already installed.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the global tracing subscriber on first use.
///
/// Later calls return a handle without touching global state, even when
/// given a different configuration.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for an unparsable filter and
/// [`TelemetryError::Subscriber`] if the process already has a subscriber
/// that this module did not install.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config))
        .map(|_| TelemetryHandle)
}

/// Builds the filter for `expression`, adding a directive for each compiler
/// output target the expression leaves unmentioned.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] if `expression` does not parse.
pub fn compiler_aware_filter(expression: &str) -> Result<EnvFilter, TelemetryError> {
    let mut filter = EnvFilter::try_new(expression)
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;
    for target in COMPILER_OUTPUT_TARGETS {
        if expression.contains(target) {
            continue;
        }
        let directive: Directive = format!("{target}={COMPILER_OUTPUT_LEVEL}")
            .parse()
            .map_err(|error: tracing_subscriber::filter::ParseError| {
                TelemetryError::Filter(error.to_string())
            })?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn install_subscriber(config: &Config) -> Result<(), TelemetryError> {
    let filter = compiler_aware_filter(config.log_filter())?;

    // Reader and worker threads are named after the compiler pid.
    let builder = |filter: EnvFilter| {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_timer(fmt::time::UtcTime::rfc_3339())
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = match config.log_format() {
        LogFormat::Json => Box::new(builder(filter).json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(builder(filter).compact().finish()),
    };

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn rejects_unparsable_filters() {
        let error = compiler_aware_filter("sass_embedded_host=notalevel")
            .expect_err("filter should be rejected");

        assert!(matches!(error, TelemetryError::Filter(_)));
    }

    #[rstest]
    #[case("error")]
    #[case("sass_embedded_host::dispatcher=trace")]
    fn compiler_output_survives_a_quiet_filter(#[case] expression: &str) {
        let rendered = compiler_aware_filter(expression)
            .expect("filter should parse")
            .to_string()
            .to_lowercase();

        for target in COMPILER_OUTPUT_TARGETS {
            assert!(
                rendered.contains(&format!("{target}={COMPILER_OUTPUT_LEVEL}")),
                "{target} missing from {rendered}"
            );
        }
    }

    #[rstest]
    fn explicit_compiler_directives_are_respected() {
        let rendered = compiler_aware_filter("info,sass_embedded_host::compiler_stderr=off")
            .expect("filter should parse")
            .to_string()
            .to_lowercase();

        assert!(rendered.contains("sass_embedded_host::compiler_stderr=off"));
        assert!(!rendered.contains(&format!(
            "sass_embedded_host::compiler_stderr={COMPILER_OUTPUT_LEVEL}"
        )));
        assert!(rendered.contains(&format!(
            "sass_embedded_host::compiler_log={COMPILER_OUTPUT_LEVEL}"
        )));
    }
}
