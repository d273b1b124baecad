//! Bounded external-process invocation.
//!
//! Output is always captured, stdin is closed, and the environment is
//! replaced with the unit's boot environment. A child that outlives its time
//! budget is killed when its wait future is dropped.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{VexecError, VexecResult};
use crate::utils::tail_summary;

/// How much of stderr is kept in a failure reason.
pub const STDERR_SUMMARY_CHARS: usize = 512;

/// Captured output of a successful process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Trailing stdout, for result details.
    pub fn summary(&self) -> String {
        tail_summary(&self.stdout, 256)
    }
}

/// Run `program` with `args` in `cwd`, killing it after `limit`.
pub async fn run_command(
    program: impl AsRef<OsStr>,
    args: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    limit: Duration,
) -> VexecResult<ProcessOutput> {
    let program = program.as_ref();
    let shown = program.to_string_lossy().into_owned();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Spawning {} {:?} in {}", shown, args, cwd.display());

    let child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VexecError::RuntimeNotFound(shown.clone()),
        _ => VexecError::Io(e),
    })?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(VexecError::Timeout {
                program: shown,
                limit,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        return Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout,
            stderr,
        });
    }

    let reason = if stderr.trim().is_empty() { &stdout } else { &stderr };
    Err(VexecError::ExternalProcessFailure {
        exit_code: output.status.code(),
        stderr: tail_summary(reason, STDERR_SUMMARY_CHARS),
    })
}
