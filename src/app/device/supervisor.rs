use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::parse::is_device_online;
use crate::app::adb::runner::{CommandInvocation, CommandRunner, ProcessHandle};
use crate::app::clock::{poll_until, Clock, PollOutcome, PollStep};
use crate::app::config::{check_device_port, DeviceSettings};
use crate::app::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Idle,
    Starting,
    Booting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceHandle {
    pub avd_name: String,
    pub port: u16,
    pub serial: String,
    pub pid: Option<u32>,
    pub ready: bool,
    /// Adopted from an emulator this run did not spawn.
    pub attached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub elapsed: Duration,
    pub attempts: u32,
}

struct Inner {
    state: DeviceState,
    handle: DeviceHandle,
    boot: Option<BootReport>,
    retired: bool,
}

type SharedProcess = Arc<Mutex<Option<Box<dyn ProcessHandle>>>>;

/// Owns exactly one emulator process from spawn to kill.
///
/// All methods take `&self` so a stop issued from the cleanup path can
/// interrupt a boot poll running on a stage thread.
pub struct VirtualDeviceSupervisor {
    runner: Arc<dyn CommandRunner>,
    bridge: DeviceBridge,
    clock: Arc<dyn Clock>,
    emulator_program: String,
    settings: DeviceSettings,
    trace_id: String,
    inner: Mutex<Inner>,
    process: SharedProcess,
}

impl VirtualDeviceSupervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bridge: DeviceBridge,
        clock: Arc<dyn Clock>,
        emulator_program: impl Into<String>,
        settings: DeviceSettings,
    ) -> Self {
        let trace_id = bridge.trace_id().to_string();
        let handle = DeviceHandle {
            avd_name: settings.avd_name.clone(),
            port: settings.port,
            serial: settings.serial(),
            pid: None,
            ready: false,
            attached: false,
        };
        Self {
            runner,
            bridge,
            clock,
            emulator_program: emulator_program.into(),
            settings,
            trace_id,
            inner: Mutex::new(Inner {
                state: DeviceState::Idle,
                handle,
                boot: None,
                retired: false,
            }),
            process: Arc::new(Mutex::new(None)),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: DeviceState) {
        let mut inner = self.inner();
        debug!(trace_id = %self.trace_id, from = ?inner.state, to = ?state, "device state");
        inner.state = state;
        if state != DeviceState::Ready {
            inner.handle.ready = false;
        }
    }

    pub fn state(&self) -> DeviceState {
        self.inner().state
    }

    pub fn serial(&self) -> String {
        self.inner().handle.serial.clone()
    }

    /// Snapshot of the handle; a spawned device whose process is gone is
    /// never reported ready.
    pub fn handle(&self) -> DeviceHandle {
        let alive = self.device_alive();
        let mut inner = self.inner();
        if !alive {
            inner.handle.ready = false;
            inner.handle.pid = None;
        }
        inner.handle.clone()
    }

    /// Wait recorded by the last successful `wait_ready`.
    pub fn boot_report(&self) -> Option<BootReport> {
        self.inner().boot
    }

    /// Refuses any later `start`, so a start abandoned on a timed-out stage
    /// thread cannot spawn a device after cleanup ran.
    pub fn retire(&self) {
        self.inner().retired = true;
    }

    fn process_alive(&self) -> bool {
        let mut guard = self.process.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_mut().map(|process| process.is_alive()).unwrap_or(false)
    }

    /// An adopted device has no process here; the bridge decides its health.
    fn device_alive(&self) -> bool {
        self.inner().handle.attached || self.process_alive()
    }

    fn output_tail(&self) -> Vec<String> {
        let guard = self.process.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|process| process.output_tail()).unwrap_or_default()
    }

    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "-avd".to_string(),
            self.settings.avd_name.clone(),
            "-port".to_string(),
            self.settings.port.to_string(),
        ];
        if self.settings.no_audio {
            args.push("-no-audio".to_string());
        }
        if self.settings.headless {
            args.push("-no-window".to_string());
        }
        args.extend(self.settings.extra_args.split_whitespace().map(|arg| arg.to_string()));
        args
    }

    /// Spawns the emulator. When the port's serial is already attached the
    /// start fails, unless `reuse_running` is set, in which case the running
    /// device is adopted and left alive on stop.
    pub fn start(&self) -> Result<DeviceHandle, AppError> {
        let (state, retired) = {
            let inner = self.inner();
            (inner.state, inner.retired)
        };
        if retired {
            return Err(AppError::validation("device supervisor already released", &self.trace_id));
        }
        if !matches!(state, DeviceState::Idle | DeviceState::Stopped) {
            return Err(AppError::validation(
                format!("device cannot start from state {state:?}"),
                &self.trace_id,
            ));
        }
        check_device_port(&self.settings, &self.trace_id)?;
        let serial = self.serial();
        let attached = self.bridge.list_devices()?;
        if attached.iter().any(|device| device.serial == serial) {
            if self.settings.reuse_running {
                return Ok(self.adopt(&serial));
            }
            return Err(AppError::validation(
                format!("{serial} is already attached; port {} is in use", self.settings.port),
                &self.trace_id,
            ));
        }

        self.set_state(DeviceState::Starting);
        let invocation = CommandInvocation::new(self.emulator_program.clone(), self.launch_args());
        info!(trace_id = %self.trace_id, serial = %serial, command = %invocation, "starting device");
        let process = match self.runner.spawn(&invocation, &self.trace_id) {
            Ok(process) => process,
            Err(err) => {
                warn!(trace_id = %self.trace_id, serial = %serial, error = %err, "device spawn failed");
                self.set_state(DeviceState::Failed);
                return Err(err);
            }
        };
        let pid = process.pid();

        let mut inner = self.inner();
        if inner.retired || inner.state != DeviceState::Starting {
            drop(inner);
            let mut process = process;
            if let Err(err) = process.terminate() {
                warn!(trace_id = %self.trace_id, pid, error = %err, "terminate after cancelled start failed");
            }
            return Err(AppError::system("device stopped during start", &self.trace_id));
        }
        *self.process.lock().unwrap_or_else(|p| p.into_inner()) = Some(process);
        inner.handle.pid = Some(pid);
        inner.state = DeviceState::Booting;
        info!(trace_id = %self.trace_id, serial = %serial, pid, "device process spawned");
        Ok(inner.handle.clone())
    }

    fn adopt(&self, serial: &str) -> DeviceHandle {
        let mut inner = self.inner();
        inner.handle.attached = true;
        inner.handle.pid = None;
        inner.state = DeviceState::Booting;
        info!(trace_id = %self.trace_id, serial = %serial, "attaching to running device");
        inner.handle.clone()
    }

    fn probe_ready(&self, serial: &str) -> PollStep<()> {
        if matches!(self.state(), DeviceState::Stopping | DeviceState::Stopped) {
            return PollStep::Abort(AppError::system("device stopped while booting", &self.trace_id));
        }
        if !self.device_alive() {
            let tail = self.output_tail().join("\n");
            return PollStep::Abort(AppError::system(
                format!("device process exited during boot: {tail}"),
                &self.trace_id,
            ));
        }
        // Transient bridge errors are expected while adbd comes up.
        let devices = match self.bridge.list_devices() {
            Ok(devices) => devices,
            Err(err) => {
                debug!(trace_id = %self.trace_id, error = %err, "device list unavailable");
                return PollStep::Pending;
            }
        };
        if !is_device_online(&devices, serial) {
            return PollStep::Pending;
        }
        if self.settings.require_boot_completed {
            match self.bridge.boot_completed(serial) {
                Ok(true) => {}
                Ok(false) => return PollStep::Pending,
                Err(err) => {
                    debug!(trace_id = %self.trace_id, error = %err, "boot property unavailable");
                    return PollStep::Pending;
                }
            }
        }
        PollStep::Ready(())
    }

    /// Polls until the device is listed, online and (optionally) finished
    /// booting, bounded by the configured boot timeout.
    pub fn wait_ready(&self) -> Result<BootReport, AppError> {
        match self.state() {
            DeviceState::Ready => {
                return Ok(BootReport {
                    elapsed: Duration::ZERO,
                    attempts: 0,
                })
            }
            DeviceState::Booting => {}
            other => {
                return Err(AppError::validation(
                    format!("device is not booting (state {other:?})"),
                    &self.trace_id,
                ))
            }
        }
        let serial = self.serial();
        let timeout = self.settings.boot_timeout();
        let outcome = poll_until(
            self.clock.as_ref(),
            self.settings.poll_interval(),
            timeout,
            |_| self.probe_ready(&serial),
        );
        match outcome {
            PollOutcome::Ready { elapsed, attempts, .. } => {
                let mut inner = self.inner();
                if inner.state != DeviceState::Booting {
                    return Err(AppError::system("device stopped while booting", &self.trace_id));
                }
                inner.state = DeviceState::Ready;
                inner.handle.ready = true;
                inner.boot = Some(BootReport { elapsed, attempts });
                info!(
                    trace_id = %self.trace_id,
                    serial = %serial,
                    elapsed_ms = elapsed.as_millis() as u64,
                    attempts,
                    "device ready"
                );
                Ok(BootReport { elapsed, attempts })
            }
            PollOutcome::TimedOut { elapsed, attempts } => {
                warn!(trace_id = %self.trace_id, serial = %serial, attempts, "boot timeout");
                self.fail_if_booting();
                Err(AppError::timeout(
                    format!("boot timeout after {}s", elapsed.as_secs()),
                    &self.trace_id,
                ))
            }
            PollOutcome::Failed { error, .. } => {
                warn!(trace_id = %self.trace_id, serial = %serial, error = %error, "boot failed");
                self.fail_if_booting();
                Err(error)
            }
        }
    }

    fn fail_if_booting(&self) {
        let mut inner = self.inner();
        if matches!(inner.state, DeviceState::Starting | DeviceState::Booting) {
            inner.state = DeviceState::Failed;
            inner.handle.ready = false;
        }
    }

    /// Ready only while the process is alive and the bridge still sees it online.
    pub fn health_check(&self) -> bool {
        if self.state() != DeviceState::Ready {
            return false;
        }
        if !self.device_alive() {
            self.inner().handle.ready = false;
            return false;
        }
        let serial = self.serial();
        match self.bridge.list_devices() {
            Ok(devices) => is_device_online(&devices, &serial),
            Err(_) => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DeviceState::Ready && self.device_alive()
    }

    pub fn is_running(&self) -> bool {
        self.process_alive()
    }

    /// Issues `emu kill` and terminates the process; both are always attempted.
    /// An adopted device is released without being killed. A second call is
    /// a no-op. Fails with `ERR_PROCESS_ORPHAN` only when neither path
    /// succeeded.
    pub fn stop(&self) -> Result<(), AppError> {
        let previous = {
            let mut inner = self.inner();
            let previous = inner.state;
            if matches!(previous, DeviceState::Idle | DeviceState::Stopped) {
                return Ok(());
            }
            if previous != DeviceState::Failed {
                inner.state = DeviceState::Stopping;
            }
            inner.handle.ready = false;
            previous
        };

        let process = self.process.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut process) = process else {
            if self.inner().handle.attached {
                info!(trace_id = %self.trace_id, serial = %self.serial(), "releasing attached device");
            }
            self.finish_stop(previous);
            return Ok(());
        };

        let serial = self.serial();
        let pid = process.pid();
        info!(trace_id = %self.trace_id, serial = %serial, pid, "stopping device");
        let kill_result = self.bridge.kill_emulator(&serial);
        if let Err(err) = &kill_result {
            warn!(trace_id = %self.trace_id, serial = %serial, error = %err, "emu kill failed");
        }
        let terminate_result = process.terminate();
        if let Err(err) = &terminate_result {
            warn!(trace_id = %self.trace_id, serial = %serial, pid, error = %err, "terminate failed");
        }

        self.finish_stop(previous);
        match (kill_result, terminate_result) {
            (Err(kill_err), Err(term_err)) => Err(AppError::process_orphan(
                format!(
                    "device process may still be running (pid {pid}): emu kill: {}; terminate: {}",
                    kill_err.error, term_err.error
                ),
                &self.trace_id,
            )),
            _ => Ok(()),
        }
    }

    fn finish_stop(&self, previous: DeviceState) {
        let mut inner = self.inner();
        inner.handle.pid = None;
        inner.handle.ready = false;
        inner.handle.attached = false;
        inner.state = if previous == DeviceState::Failed {
            DeviceState::Failed
        } else {
            DeviceState::Stopped
        };
    }
}
