//! Bounded execution of external tools

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Captured result of a finished child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr together, for output classification.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Command preconfigured for unattended execution: no stdin, captured output,
/// no console window, and killed if the waiting future is dropped.
pub fn tool_command(program: &Path) -> Command {
    let mut command = Command::new(program);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);
    command
}

/// Run `command` to completion within `timeout`.
///
/// A spawn failure because the program is missing maps to `ToolNotFound`,
/// running past the budget maps to `Timeout`. A nonzero exit code is not an
/// error here; callers classify output themselves.
pub async fn run_tool(mut command: Command, operation: &str, timeout: Duration) -> Result<ToolOutput> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let started = Instant::now();

    let child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SyncError::tool_not_found(program.clone()),
        _ => SyncError::Unexpected(format!("failed to start {}: {}", program, e)),
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(operation, program = %program, timeout_secs = timeout.as_secs(), "Tool timed out");
            return Err(SyncError::timeout(operation, timeout));
        }
    };

    let output = ToolOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(
        operation,
        program = %program,
        exit_code = ?output.exit_code,
        duration_ms = started.elapsed().as_millis() as u64,
        "Tool finished"
    );
    Ok(output)
}
