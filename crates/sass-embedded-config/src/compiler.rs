//! Command line used to launch the embedded compiler.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::defaults::{default_compiler_args, default_compiler_program};

/// Configuration for spawning the compiler process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompilerCommand {
    /// The executable path or command name.
    #[serde(default = "default_compiler_program")]
    pub program: PathBuf,
    /// Arguments passed to the compiler.
    #[serde(default = "default_compiler_args")]
    pub args: Vec<String>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CompilerCommand {
    /// Creates a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Replaces the argument list.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a custom working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Renders the command line for diagnostics.
    #[must_use]
    pub fn display(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

impl Default for CompilerCommand {
    /// `sass --embedded`, resolved through `PATH`.
    fn default() -> Self {
        Self {
            program: default_compiler_program(),
            args: default_compiler_args(),
            working_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn default_runs_sass_in_embedded_mode() {
        let command = CompilerCommand::default();

        assert_eq!(command.program, PathBuf::from("sass"));
        assert_eq!(command.args, vec!["--embedded"]);
        assert!(command.working_dir.is_none());
    }

    #[rstest]
    fn builder_methods_work() {
        let command = CompilerCommand::new("/opt/dart-sass/sass")
            .with_args(["--embedded", "--quiet"])
            .with_working_dir("/workspace");

        assert_eq!(command.args, vec!["--embedded", "--quiet"]);
        assert_eq!(command.working_dir, Some(PathBuf::from("/workspace")));
    }

    #[rstest]
    #[case(CompilerCommand::new("cat"), "cat")]
    #[case(CompilerCommand::default(), "sass --embedded")]
    fn display_joins_program_and_args(#[case] command: CompilerCommand, #[case] expected: &str) {
        assert_eq!(command.display(), expected);
    }

    #[rstest]
    fn missing_fields_fall_back_to_defaults() {
        let command: CompilerCommand =
            serde_json::from_str(r#"{"working_dir":"/tmp"}"#).expect("parse failed");

        assert_eq!(command.program, PathBuf::from("sass"));
        assert_eq!(command.args, vec!["--embedded"]);
        assert_eq!(command.working_dir, Some(PathBuf::from("/tmp")));
    }
}
