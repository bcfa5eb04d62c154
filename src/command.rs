//! External helper execution
//!
//! `run_command` is the one way this crate starts external programs: the
//! child runs in its own process group and is tracked in the
//! [`ChildRegistry`] for as long as it runs.

use crate::error::{DriverDiskError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::ffi::OsStr;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Captured output of a helper program.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None if terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error carrying stderr.
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(DriverDiskError::system(format!(
                "{} failed (exit {}): {}",
                what,
                self.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                self.stderr.trim()
            )))
        }
    }
}

/// Run `program` with `args`, wait for it and capture its output.
///
/// Spawn failures are errors; a non-zero exit is reported through
/// [`CommandOutput::success`].
pub fn run_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<CommandOutput> {
    let printable: Vec<_> = args.iter().map(|a| a.as_ref().to_string_lossy()).collect();
    info!("run: {} {}", program, printable.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group()
        .spawn()
        .map_err(|e| DriverDiskError::system(format!("unable to start {}: {}", program, e)))?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }
    let waited = child.wait_with_output();
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let output = waited
        .map_err(|e| DriverDiskError::system(format!("waiting for {}: {}", program, e)))?;
    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };
    debug!("{} exited with {:?}", program, result.exit_code);
    Ok(result)
}

/// True if `program` resolves on PATH.
pub fn is_available(program: &str) -> bool {
    run_command("which", &[program])
        .map(|out| out.success)
        .unwrap_or(false)
}
