//! Subprocess execution with a hard timeout.
//!
//! Every external tool stackctl drives (container runtime, probe commands,
//! proxy validate/reload, certificate client) goes through [`run`], so no
//! invocation can wait forever.

use crate::error::ExecError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured stdout (lossy UTF-8)
    pub stdout: String,
    /// Captured stderr (lossy UTF-8)
    pub stderr: String,
}

impl CommandOutput {
    /// True when the command exited with status 0
    #[inline]
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last `max_lines` lines of stderr, falling back to stdout when stderr is empty
    #[must_use]
    pub fn error_tail(&self, max_lines: usize) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail_lines(text, max_lines)
    }
}

/// Run `program args..` and wait for it, killing it after `timeout`.
///
/// # Errors
///
/// - `ExecError::Spawn` if the program cannot be started
/// - `ExecError::TimedOut` if it does not exit in time
pub async fn run(program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(source)) => Err(ExecError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(ExecError::TimedOut {
            program: program.to_string(),
            after: timeout,
        }),
    }
}

/// Run a full command line given as `[program, args..]`.
///
/// # Errors
///
/// `ExecError::EmptyCommand` for an empty slice, otherwise as [`run`].
pub async fn run_argv(argv: &[String], timeout: Duration) -> Result<CommandOutput, ExecError> {
    let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
    run(program, args, timeout).await
}

/// Last `max_lines` non-empty lines of `text`
#[must_use]
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
