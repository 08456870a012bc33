//! The executor interface: component F of the engine (`spec.md` §4.F).
//!
//! The core never spawns a process directly; it only ever holds an
//! `Arc<dyn Executor>` and propagates whatever error a concrete
//! implementation reports. [`ProcessExecutor`] is the one concrete
//! collaborator this crate ships, the same way the teacher's own driver
//! ships concrete TeX-worker subprocess plumbing (`texworker.rs`,
//! `tex_pass.rs`) rather than leaving process execution purely abstract.
//! The timeout-watchdog-thread pattern and the `ExecutionTimedOut` /
//! `ExecutionError` / `SpawnError` taxonomy are grounded directly on
//! `fbuild/context.py`'s `execute()`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// One subprocess invocation request.
pub struct ExecRequest<'a> {
    pub argv: &'a [OsString],
    pub stdin: Option<&'a [u8]>,
    pub env: Option<&'a HashMap<OsString, OsString>>,
    pub timeout: Option<Duration>,
    pub capture: bool,
}

/// The result of a completed subprocess invocation. `exit_code` is
/// whatever the platform reports for a clean exit; `Executor` impls
/// report non-zero codes as [`Error::ExecutionError`] rather than success.
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

fn argv_display(argv: &[OsString]) -> String {
    argv.iter().map(|s| s.to_string_lossy()).collect::<Vec<_>>().join(" ")
}

/// The abstract contract the core uses to invoke external tools
/// (compilers, archivers, linkers). The core depends only on this trait;
/// concrete process handling is an external collaborator.
pub trait Executor: Send + Sync {
    fn execute(&self, request: ExecRequest) -> Result<ExecOutput>;
}

/// The default, concrete `Executor`: spawns a real OS subprocess via
/// [`std::process::Command`], optionally killing it on a timeout watched
/// by a dedicated thread.
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        ProcessExecutor
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ProcessExecutor {
    fn execute(&self, request: ExecRequest) -> Result<ExecOutput> {
        let argv_str = argv_display(request.argv);
        let (program, rest) = request
            .argv
            .split_first()
            .ok_or_else(|| Error::BuildScriptError("empty argv passed to executor".to_string()))?;

        let mut command = Command::new(program);
        command.args(rest);
        command.stdin(if request.stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        command.stdout(if request.capture { Stdio::piped() } else { Stdio::inherit() });
        command.stderr(if request.capture { Stdio::piped() } else { Stdio::inherit() });

        if let Some(env) = request.env {
            command.env_clear();
            command.envs(env);
        }

        let mut child = command.spawn().map_err(|source| Error::SpawnError { argv: argv_str.clone(), source })?;

        if let Some(input) = request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(input);
            }
        }

        match request.timeout {
            None => {
                let output = child.wait_with_output()?;
                finish(argv_str, output.status.code().unwrap_or(-1), output.stdout, output.stderr)
            }
            Some(timeout) => wait_with_timeout(child, timeout, argv_str),
        }
    }
}

fn finish(argv: String, exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>) -> Result<ExecOutput> {
    if exit_code != 0 {
        return Err(Error::ExecutionError { argv, exit_code });
    }
    Ok(ExecOutput { stdout, stderr, exit_code })
}

/// Races the child's exit against `timeout` by polling `try_wait` on the
/// calling thread, while dedicated reader threads drain stdout/stderr
/// concurrently so a full pipe buffer can't wedge the child. If the
/// deadline passes first, the child is killed and `ExecutionTimedOut` is
/// reported. Mirrors `fbuild/context.py`'s `execute()`, which races a
/// timer thread against `Popen.communicate()` for the same reason.
fn wait_with_timeout(mut child: std::process::Child, timeout: Duration, argv: String) -> Result<ExecOutput> {
    const POLL: Duration = Duration::from_millis(20);

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = std::time::Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if std::time::Instant::now() >= deadline {
            break None;
        }
        thread::sleep(POLL);
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    match status {
        Some(status) => finish(argv, status.code().unwrap_or(-1), stdout, stderr),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(Error::ExecutionTimedOut {
                argv,
                elapsed_secs: timeout.as_secs_f32(),
            })
        }
    }
}

fn spawn_pipe_reader(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<OsString> {
        parts.iter().map(OsString::from).collect()
    }

    #[test]
    fn a_successful_command_captures_stdout() {
        let executor = ProcessExecutor::new();
        let args = argv(&["/bin/echo", "hello"]);
        let output = executor
            .execute(ExecRequest {
                argv: &args,
                stdin: None,
                env: None,
                timeout: None,
                capture: true,
            })
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn a_nonzero_exit_is_reported_as_execution_error() {
        let executor = ProcessExecutor::new();
        let args = argv(&["/bin/sh", "-c", "exit 7"]);
        let err = executor
            .execute(ExecRequest {
                argv: &args,
                stdin: None,
                env: None,
                timeout: None,
                capture: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionError { exit_code: 7, .. }));
    }

    #[test]
    fn a_slow_command_times_out() {
        let executor = ProcessExecutor::new();
        let args = argv(&["/bin/sleep", "5"]);
        let err = executor
            .execute(ExecRequest {
                argv: &args,
                stdin: None,
                env: None,
                timeout: Some(Duration::from_millis(100)),
                capture: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionTimedOut { .. }));
    }

    #[test]
    fn a_missing_program_is_a_spawn_error() {
        let executor = ProcessExecutor::new();
        let args = argv(&["/no/such/program-xyz"]);
        let err = executor
            .execute(ExecRequest {
                argv: &args,
                stdin: None,
                env: None,
                timeout: None,
                capture: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::SpawnError { .. }));
    }
}
