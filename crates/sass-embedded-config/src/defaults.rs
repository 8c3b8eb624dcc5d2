//! Default values shared by the configuration types.

use std::path::PathBuf;

/// Default compiler executable looked up on `PATH`.
pub const DEFAULT_COMPILER: &str = "sass";

/// Flag switching the compiler into embedded protocol mode.
pub const EMBEDDED_FLAG: &str = "--embedded";

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default compiler executable as a path.
#[must_use]
pub fn default_compiler_program() -> PathBuf {
    PathBuf::from(DEFAULT_COMPILER)
}

/// Default compiler arguments.
#[must_use]
pub fn default_compiler_args() -> Vec<String> {
    vec![EMBEDDED_FLAG.to_owned()]
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}
