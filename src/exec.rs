//! External command execution.
//!
//! Every external effect of the engine — discovery commands, parse scripts,
//! install scripts, prerequisite checks, stage scripts — goes through the
//! [`Executor`] capability so that tests can substitute a scripted fake and
//! the orchestrator can enforce the caller-supplied timeout uniformly.

use std::io::{Read, Write as _};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::ResourceError;

/// Poll interval while waiting for a child process to exit.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// Whether the process exited with a zero status.
    pub success: bool,
    /// Exit code, if the process terminated normally.
    pub code: Option<i32>,
}

impl ExecResult {
    /// Convert a non-zero exit into a [`ResourceError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` carrying the exit code and trimmed stderr when
    /// the command did not succeed.
    pub fn require_success(self, command: &str) -> Result<Self, ResourceError> {
        if self.success {
            Ok(self)
        } else {
            Err(ResourceError::CommandFailed {
                command: command.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Command execution capability.
///
/// Non-zero exits are reported through [`ExecResult::success`], not as
/// errors — callers decide whether a failure is fatal. Spawn failures and
/// timeouts are always errors.
pub trait Executor: Send + Sync {
    /// Run a program with arguments.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if the process cannot be spawned and
    /// `CommandTimeout` if it outlives `timeout`.
    fn run(&self, program: &str, args: &[&str], timeout: Duration)
    -> Result<ExecResult, ResourceError>;

    /// Run a command line through the platform shell.
    ///
    /// # Errors
    ///
    /// Same contract as [`Executor::run`].
    fn run_shell(&self, command: &str, timeout: Duration) -> Result<ExecResult, ResourceError>;

    /// Run a command line through the platform shell, feeding `stdin` to it.
    ///
    /// Used to pipe discovery output through a parse script.
    ///
    /// # Errors
    ///
    /// Same contract as [`Executor::run`].
    fn run_shell_with_stdin(
        &self,
        command: &str,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ResourceError>;

    /// Check whether a program is available on PATH.
    fn which(&self, program: &str) -> bool;
}

/// [`Executor`] backed by real process spawning.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<ExecResult, ResourceError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        spawn_and_wait(cmd, program, timeout, None)
    }

    fn run_shell(&self, command: &str, timeout: Duration) -> Result<ExecResult, ResourceError> {
        spawn_and_wait(shell_command(command), command, timeout, None)
    }

    fn run_shell_with_stdin(
        &self,
        command: &str,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ResourceError> {
        spawn_and_wait(shell_command(command), command, timeout, Some(stdin))
    }

    fn which(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Build a platform shell invocation for a command line.
fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Spawn a child, enforce the timeout, and collect its output.
///
/// stdout and stderr are drained on dedicated threads so a filled pipe can
/// never deadlock the wait loop; the child is killed when the deadline
/// passes, which is reported as [`ResourceError::CommandTimeout`].
fn spawn_and_wait(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
    stdin_data: Option<&str>,
) -> Result<ExecResult, ResourceError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().map_err(|e| ResourceError::CommandFailed {
        command: label.to_string(),
        code: None,
        stderr: format!("failed to spawn: {e}"),
    })?;

    if let Some(data) = stdin_data
        && let Some(mut stdin) = child.stdin.take()
    {
        let data = data.to_owned();
        std::thread::spawn(move || {
            let _ = stdin.write_all(data.as_bytes());
        });
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || read_stream(stdout));
    let err_reader = std::thread::spawn(move || read_stream(stderr));

    let status = wait_with_deadline(&mut child, label, timeout)?;

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();

    Ok(ExecResult {
        stdout,
        stderr,
        success: status.success(),
        code: status.code(),
    })
}

/// Poll the child until it exits or the deadline passes.
fn wait_with_deadline(
    child: &mut Child,
    label: &str,
    timeout: Duration,
) -> Result<std::process::ExitStatus, ResourceError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ResourceError::CommandTimeout {
                        command: label.to_string(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
                std::thread::sleep(WAIT_POLL);
            }
            Err(e) => {
                return Err(ResourceError::CommandFailed {
                    command: label.to_string(),
                    code: None,
                    stderr: format!("wait failed: {e}"),
                });
            }
        }
    }
}

/// Drain a child stream to a lossy UTF-8 string.
fn read_stream<R: Read>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).to_string()
}
