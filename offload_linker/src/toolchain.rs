//! External tool lookup and invocation.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

/// Failure of one external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' {}{}", exit_text(.status), stderr_text(.stderr))]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

fn exit_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

fn stderr_text(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{trimmed}")
    }
}

impl CommandError {
    /// Exit status of the failed process, if it exited normally.
    pub fn status(&self) -> Option<i32> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Failed { status, .. } => *status,
        }
    }
}

/// Resolve a tool. Paths are checked as given; bare names are searched in
/// `search_path` (a `PATH`-style list).
pub fn find_program(program: &Path, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    which::which_in(program, search_path, cwd).ok()
}

/// A command line for an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Run to completion; a non-zero exit is an error carrying stderr.
    pub fn run(&self) -> Result<(), CommandError> {
        debug!(command = %self, "running");
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(CommandError::Failed {
            program,
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}
