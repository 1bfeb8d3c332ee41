//! Scripted runner, fake processes and a virtual clock for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::app::adb::runner::{CommandInvocation, CommandOutput, CommandRunner, ProcessHandle};
use crate::app::clock::Clock;
use crate::app::error::AppError;

pub fn ok(stdout: &str) -> Result<CommandOutput, AppError> {
    exit(0, stdout, "")
}

pub fn exit(code: i32, stdout: &str, stderr: &str) -> Result<CommandOutput, AppError> {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
        duration: Duration::from_millis(5),
    })
}

/// `adb devices -l` output listing `serials` in the `device` state.
pub fn devices_output(serials: &[&str]) -> String {
    let mut output = String::from("List of devices attached\n");
    for serial in serials {
        output.push_str(&format!("{serial}\tdevice product:sdk_gphone64 model:sdk_gphone64\n"));
    }
    output
}

#[derive(Clone)]
pub struct FakeClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().expect("clock lock")
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock().expect("clock lock") += duration;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Default)]
pub struct FakeProcessState {
    pub alive: AtomicBool,
    pub terminate_calls: AtomicUsize,
    pub fail_terminate: AtomicBool,
}

impl FakeProcessState {
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

pub struct FakeProcess {
    pid: u32,
    state: Arc<FakeProcessState>,
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        self.state.is_alive()
    }

    fn terminate(&mut self) -> Result<(), AppError> {
        self.state.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.state.is_alive() {
            return Ok(());
        }
        if self.state.fail_terminate.load(Ordering::SeqCst) {
            return Err(AppError::system("kill refused", "fake"));
        }
        self.state.exit();
        Ok(())
    }

    fn output_tail(&self) -> Vec<String> {
        vec!["emulator: INFO: boot started".to_string()]
    }
}

type Handler = Box<dyn Fn(&CommandInvocation) -> Result<CommandOutput, AppError> + Send + Sync>;

/// A `CommandRunner` that answers from a closure and records every call.
pub struct FakeRunner {
    handler: Handler,
    calls: Mutex<Vec<String>>,
    spawn_error: Mutex<Option<AppError>>,
    fail_terminate: AtomicBool,
    processes: Mutex<Vec<Arc<FakeProcessState>>>,
}

impl FakeRunner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CommandInvocation) -> Result<CommandOutput, AppError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            spawn_error: Mutex::new(None),
            fail_terminate: AtomicBool::new(false),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_spawn(self, error: AppError) -> Self {
        *self.spawn_error.lock().expect("spawn lock") = Some(error);
        self
    }

    pub fn refuse_terminate(self) -> Self {
        self.fail_terminate.store(true, Ordering::SeqCst);
        self
    }

    /// Every `run` and `spawn` invocation rendered as a command line, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(needle)).count()
    }

    pub fn last_process(&self) -> Option<Arc<FakeProcessState>> {
        self.processes.lock().expect("process lock").last().cloned()
    }

    pub fn spawned(&self) -> usize {
        self.processes.lock().expect("process lock").len()
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        invocation: &CommandInvocation,
        _timeout: Duration,
        _trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        self.calls.lock().expect("calls lock").push(invocation.to_string());
        (self.handler)(invocation)
    }

    fn spawn(
        &self,
        invocation: &CommandInvocation,
        _trace_id: &str,
    ) -> Result<Box<dyn ProcessHandle>, AppError> {
        self.calls.lock().expect("calls lock").push(invocation.to_string());
        if let Some(err) = self.spawn_error.lock().expect("spawn lock").clone() {
            return Err(err);
        }
        let state = Arc::new(FakeProcessState::default());
        state.alive.store(true, Ordering::SeqCst);
        state
            .fail_terminate
            .store(self.fail_terminate.load(Ordering::SeqCst), Ordering::SeqCst);
        let mut processes = self.processes.lock().expect("process lock");
        processes.push(Arc::clone(&state));
        Ok(Box::new(FakeProcess {
            pid: 4000 + processes.len() as u32,
            state,
        }))
    }
}
