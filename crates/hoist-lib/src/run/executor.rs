//! The executor seam.
//!
//! The scheduler never spawns subprocesses itself; it hands a
//! [`TaskInvocation`] to whatever [`TaskExecutor`] the caller supplied and
//! interprets the result. [`ProcessExecutor`] is the stock implementation
//! that shells out; tests substitute in-memory executors.

use std::{
    collections::BTreeMap,
    io::{self, Read},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use camino::Utf8PathBuf;
use hoist_task_id::TaskId;
use thiserror::Error;

/// Cooperative cancellation handle threaded into every execution. Tripping
/// it asks executors to kill whatever they are running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub task_id: TaskId<'static>,
    pub command: String,
    /// Absolute directory the command runs in.
    pub cwd: Utf8PathBuf,
    pub env: BTreeMap<String, String>,
    /// Deadline the executor enforces; expiry reads as [`ExecOutcome::TimedOut`].
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Completed { exit_code: i32 },
    TimedOut,
    Killed,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: ExecOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub runtime: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, ExecOutcome::Completed { exit_code: 0 })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExecOutcome::Completed { exit_code } => Some(exit_code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("IO error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// The function the scheduler invokes for each leaf task. Implementations
/// run the command to completion (or until the deadline/cancel token says
/// otherwise) and report exit status plus captured output.
pub trait TaskExecutor: Send + Sync {
    fn execute(
        &self,
        invocation: &TaskInvocation,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecuteError>;
}

/// Blocking subprocess executor: runs the command through the system shell
/// in the package directory, polling for deadline expiry and cancellation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

impl TaskExecutor for ProcessExecutor {
    fn execute(
        &self,
        invocation: &TaskInvocation,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        let mut command = shell_command(&invocation.command);
        command
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecuteError::Spawn {
            command: invocation.command.clone(),
            source,
        })?;

        let io_error = |source| ExecuteError::Io {
            command: invocation.command.clone(),
            source,
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdout_reader = std::thread::spawn(move || read_all(stdout));
        let stderr_reader = std::thread::spawn(move || read_all(stderr));

        let outcome = loop {
            if let Some(status) = child.try_wait().map_err(io_error)? {
                break ExecOutcome::Completed {
                    exit_code: status.code().unwrap_or(-1),
                };
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                break ExecOutcome::Killed;
            }
            if let Some(timeout) = invocation.timeout {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    break ExecOutcome::TimedOut;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_reader
            .join()
            .expect("stdout reader does not panic")
            .map_err(io_error)?;
        let stderr = stderr_reader
            .join()
            .expect("stderr reader does not panic")
            .map_err(io_error)?;

        Ok(ExecutionResult {
            outcome,
            stdout,
            stderr,
            runtime: started.elapsed(),
        })
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn read_all<R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn invocation(command: &str) -> TaskInvocation {
        TaskInvocation {
            task_id: TaskId::new("pkg", "build").into_owned(),
            command: command.to_owned(),
            cwd: Utf8PathBuf::from("."),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_captures_output_and_exit_code() {
        let result = ProcessExecutor
            .execute(&invocation("echo hello; echo oops >&2"), &CancelToken::new())
            .unwrap();
        assert_eq!(result.outcome, ExecOutcome::Completed { exit_code: 0 });
        assert_eq!(String::from_utf8_lossy(&result.stdout), "hello\n");
        assert_eq!(String::from_utf8_lossy(&result.stderr), "oops\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_nonzero_exit() {
        let result = ProcessExecutor
            .execute(&invocation("exit 3"), &CancelToken::new())
            .unwrap();
        assert_eq!(result.outcome, ExecOutcome::Completed { exit_code: 3 });
        assert!(!result.succeeded());
    }

    #[test]
    #[cfg(unix)]
    fn test_timeout_kills_the_process() {
        let mut invocation = invocation("sleep 5");
        invocation.timeout = Some(Duration::from_millis(100));
        let result = ProcessExecutor
            .execute(&invocation, &CancelToken::new())
            .unwrap();
        assert_eq!(result.outcome, ExecOutcome::TimedOut);
        assert!(result.runtime < Duration::from_secs(4));
    }

    #[test]
    #[cfg(unix)]
    fn test_cancel_kills_the_process() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = ProcessExecutor
            .execute(&invocation("sleep 5"), &cancel)
            .unwrap();
        assert_eq!(result.outcome, ExecOutcome::Killed);
    }
}
