use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::error::AppError;

const OUTPUT_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for failure details.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{stdout}\n{stderr}"),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (true, true) => String::new(),
        }
    }
}

/// A background process started with [`CommandRunner::spawn`].
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    fn is_alive(&mut self) -> bool;

    /// Kills the process. Terminating a process that already exited is a no-op.
    fn terminate(&mut self) -> Result<(), AppError>;

    /// Most recent output lines, oldest first.
    fn output_tail(&self) -> Vec<String> {
        Vec::new()
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        invocation: &CommandInvocation,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError>;

    fn spawn(
        &self,
        invocation: &CommandInvocation,
        trace_id: &str,
    ) -> Result<Box<dyn ProcessHandle>, AppError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        invocation: &CommandInvocation,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(invocation, timeout, trace_id)
    }

    fn spawn(
        &self,
        invocation: &CommandInvocation,
        trace_id: &str,
    ) -> Result<Box<dyn ProcessHandle>, AppError> {
        let process = spawn_background(invocation, trace_id)?;
        Ok(Box::new(process))
    }
}

fn spawn_error(invocation: &CommandInvocation, err: std::io::Error, trace_id: &str) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::tool_missing(
            format!("Executable not found: {}", invocation.program),
            trace_id,
        )
    } else {
        AppError::system(
            format!("Failed to spawn {}: {err}", invocation.program),
            trace_id,
        )
    }
}

fn drain_to_buffer<R: Read + Send + 'static>(reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

pub fn run_command_with_timeout(
    invocation: &CommandInvocation,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let start = Instant::now();
    let mut child = invocation
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(invocation, err, trace_id))?;

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain_to_buffer(stdout);
    let stderr_handle = drain_to_buffer(stderr);

    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        format!("Command timed out after {}s: {invocation}", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
        duration: start.elapsed(),
    })
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

fn drain_lines<R: Read + Send + 'static>(
    reader: R,
    stream: &'static str,
    pid: u32,
    tail: OutputTail,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            debug!(pid, stream, line = %line, "device process output");
            let mut guard = tail.lock().unwrap_or_else(|p| p.into_inner());
            if guard.len() >= OUTPUT_TAIL_LINES {
                guard.pop_front();
            }
            guard.push_back(line);
        }
    })
}

/// A long-lived child whose output is continuously drained on reader threads.
pub struct SpawnedProcess {
    child: Child,
    pid: u32,
    program: String,
    trace_id: String,
    tail: OutputTail,
    // Detached on terminate: grandchildren may keep the pipes open after the child dies.
    _readers: Vec<JoinHandle<()>>,
}

pub fn spawn_background(
    invocation: &CommandInvocation,
    trace_id: &str,
) -> Result<SpawnedProcess, AppError> {
    let mut child = invocation
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(invocation, err, trace_id))?;
    let pid = child.id();

    let tail: OutputTail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(drain_lines(stdout, "stdout", pid, Arc::clone(&tail)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(drain_lines(stderr, "stderr", pid, Arc::clone(&tail)));
    }

    Ok(SpawnedProcess {
        child,
        pid,
        program: invocation.program.clone(),
        trace_id: trace_id.to_string(),
        tail,
        _readers: readers,
    })
}

impl ProcessHandle for SpawnedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<(), AppError> {
        if !self.is_alive() {
            return Ok(());
        }
        if let Err(err) = self.child.kill() {
            // Raced with a natural exit.
            if !self.is_alive() {
                return Ok(());
            }
            return Err(AppError::system(
                format!("Failed to kill {} (pid {}): {err}", self.program, self.pid),
                &self.trace_id,
            ));
        }
        if let Err(err) = self.child.wait() {
            warn!(trace_id = %self.trace_id, pid = self.pid, error = %err, "failed to reap killed process");
        }
        Ok(())
    }

    fn output_tail(&self) -> Vec<String> {
        let guard = self.tail.lock().unwrap_or_else(|p| p.into_inner());
        guard.iter().cloned().collect()
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            warn!(trace_id = %self.trace_id, pid = self.pid, error = %err, "failed to terminate dropped process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandInvocation {
        CommandInvocation::new("sh", ["-c", script])
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_timeout_does_not_deadlock_on_large_stdout() {
        // Regression test: If stdout/stderr are piped but not drained, the child can block once
        // the pipe buffer fills, causing an otherwise-fast command to "hang" until we hit the
        // timeout.
        let invocation =
            sh("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done");

        let output = run_command_with_timeout(&invocation, Duration::from_secs(10), "trace-large")
            .expect("expected large-output command to complete without timing out");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000, "got {}", output.stdout.len());
    }

    #[cfg(unix)]
    #[test]
    fn run_command_reports_timeout() {
        let err = run_command_with_timeout(&sh("sleep 5"), Duration::from_millis(200), "trace-t")
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.trace_id, "trace-t");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_captures_exit_code_and_stderr() {
        let output = run_command_with_timeout(
            &sh("echo out; echo err 1>&2; exit 3"),
            Duration::from_secs(5),
            "trace-exit",
        )
        .expect("output");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.combined(), "out\nerr");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_honors_working_dir() {
        let dir = tempfile::TempDir::new().expect("tmp");
        let invocation = sh("pwd").with_working_dir(dir.path());
        let output = run_command_with_timeout(&invocation, Duration::from_secs(5), "trace-cwd")
            .expect("output");
        let reported = std::fs::canonicalize(output.stdout.trim()).expect("canon");
        assert_eq!(reported, std::fs::canonicalize(dir.path()).expect("canon"));
    }

    #[test]
    fn missing_executable_is_tool_missing() {
        let invocation = CommandInvocation::new("/this/path/should/not/exist/adb", ["devices"]);
        let err = run_command_with_timeout(&invocation, Duration::from_secs(1), "trace-missing")
            .unwrap_err();
        assert!(err.is_tool_missing());

        let err = SystemCommandRunner
            .spawn(&invocation, "trace-missing")
            .err()
            .expect("spawn should fail");
        assert!(err.is_tool_missing());
    }

    #[cfg(unix)]
    #[test]
    fn spawned_process_terminate_is_idempotent() {
        let mut process = spawn_background(&sh("echo booting; sleep 30"), "trace-spawn")
            .expect("spawn");
        assert!(process.is_alive());
        process.terminate().expect("first terminate");
        assert!(!process.is_alive());
        process.terminate().expect("second terminate is a no-op");
    }

    #[cfg(unix)]
    #[test]
    fn spawned_process_keeps_output_tail() {
        let mut process =
            spawn_background(&sh("echo one; echo two 1>&2; sleep 30"), "trace-tail").expect("spawn");
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.output_tail().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let tail = process.output_tail();
        assert!(tail.contains(&"one".to_string()));
        assert!(tail.contains(&"two".to_string()));
        process.terminate().expect("terminate");
    }

    #[test]
    fn invocation_display_joins_args() {
        let invocation = CommandInvocation::new("adb", ["-s", "emulator-5554", "emu", "kill"]);
        assert_eq!(invocation.to_string(), "adb -s emulator-5554 emu kill");
    }
}
