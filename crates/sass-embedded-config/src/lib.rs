//! Shared configuration for the embedded Sass host.
//!
//! The host needs to know how to launch the compiler and how to log. Values
//! come from serialised configuration or from `SASS_EMBEDDED_*` environment
//! variables; anything unset falls back to the defaults in this crate.

mod compiler;
mod defaults;

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

pub use compiler::CompilerCommand;
pub use defaults::{DEFAULT_COMPILER, DEFAULT_LOG_FILTER, EMBEDDED_FLAG};

use defaults::default_log_filter_string;

/// Environment variable overriding the compiler executable.
pub const COMPILER_ENV: &str = "SASS_EMBEDDED_COMPILER";
/// Environment variable overriding the compiler arguments.
pub const COMPILER_ARGS_ENV: &str = "SASS_EMBEDDED_COMPILER_ARGS";
/// Environment variable overriding the compiler working directory.
pub const WORKING_DIR_ENV: &str = "SASS_EMBEDDED_WORKING_DIR";
/// Environment variable overriding the log filter.
pub const LOG_FILTER_ENV: &str = "SASS_EMBEDDED_LOG_FILTER";
/// Environment variable overriding the log format.
pub const LOG_FORMAT_ENV: &str = "SASS_EMBEDDED_LOG_FORMAT";

/// How host log events are rendered on stderr.
///
/// Forwarded compiler output (stderr lines and Sass `@warn`/`@debug`
/// diagnostics) goes through the same subscriber and so uses the same format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event, with fields flattened to the top level.
    #[default]
    Json,
    /// One terse text line per event.
    Compact,
}

/// Failure to parse a [`LogFormat`] name.
pub type LogFormatParseError = strum::ParseError;

/// Runtime configuration for the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// How to launch the compiler.
    #[serde(default)]
    pub compiler: CompilerCommand,
    /// `tracing` filter expression.
    #[serde(default = "default_log_filter_string")]
    pub log_filter: String,
    /// Output format for log events.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compiler: CompilerCommand::default(),
            log_filter: default_log_filter_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable holds an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable holds an unusable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(program) = lookup(COMPILER_ENV) {
            if program.trim().is_empty() {
                return Err(ConfigError::EmptyCompiler);
            }
            config.compiler.program = PathBuf::from(program.trim());
        }
        if let Some(args) = lookup(COMPILER_ARGS_ENV) {
            config.compiler.args = args.split_whitespace().map(str::to_owned).collect();
        }
        if let Some(dir) = lookup(WORKING_DIR_ENV).as_deref().and_then(non_blank) {
            config.compiler.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = lookup(LOG_FILTER_ENV).as_deref().and_then(non_blank) {
            config.log_filter = filter.to_owned();
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            config.log_format = LogFormat::from_str(format.trim())
                .map_err(|source| ConfigError::InvalidLogFormat { value: format, source })?;
        }

        Ok(config)
    }

    /// Returns the configured log filter.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Returns the configured log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

/// Trims `value`, treating an all-whitespace value as unset.
fn non_blank(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

/// Errors raised while assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The compiler program was set to an empty string.
    #[error("SASS_EMBEDDED_COMPILER must not be empty")]
    EmptyCompiler,
    /// The log format was not recognised.
    #[error("unsupported log format '{value}'")]
    InvalidLogFormat {
        /// Value supplied by the environment.
        value: String,
        /// Underlying parse failure.
        #[source]
        source: LogFormatParseError,
    },
}
