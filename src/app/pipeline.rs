use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::locator::{resolve_adb_program, resolve_emulator_program, validate_program};
use crate::app::adb::runner::{CommandRunner, SystemCommandRunner};
use crate::app::build::{provider_from_config, BuildProvider};
use crate::app::checks::{CheckSuite, ResultLog};
use crate::app::clock::{Clock, SystemClock};
use crate::app::config::{check_device_port, validate_config, PipelineConfig};
use crate::app::device::{DeviceLease, VirtualDeviceSupervisor};
use crate::app::error::AppError;
use crate::app::models::{StageKind, StageRecord, StageStatus};
use crate::app::report::{report_file_name, FileReportWriter, Report, ReportWriter};
use crate::app::scheduler::{port_locks, PortLocks};
use crate::app::stage::{Stage, StageExecutor, StageOutcome};

const STOP_POLL: Duration = Duration::from_millis(250);

type PathSlot = Arc<Mutex<Option<PathBuf>>>;

/// Everything one run needs; built fresh per `run_once`.
struct RunContext {
    trace_id: String,
    bridge: DeviceBridge,
    supervisor: Arc<VirtualDeviceSupervisor>,
    artifact: PathSlot,
    results: ResultLog,
}

pub struct Pipeline {
    config: PipelineConfig,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    build_provider: Arc<dyn BuildProvider>,
    report_writer: Arc<dyn ReportWriter>,
    adb_program: String,
    emulator_program: String,
    verify_tools: bool,
    port_locks: Arc<PortLocks>,
    active: Mutex<Option<Arc<VirtualDeviceSupervisor>>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
        build_provider: Arc<dyn BuildProvider>,
        report_writer: Arc<dyn ReportWriter>,
    ) -> Self {
        let config = validate_config(config);
        let adb_program = resolve_adb_program(&config.sdk);
        let emulator_program = resolve_emulator_program(&config.sdk);
        Self {
            config,
            runner,
            clock,
            build_provider,
            report_writer,
            adb_program,
            emulator_program,
            verify_tools: false,
            port_locks: port_locks(),
            active: Mutex::new(None),
        }
    }

    /// Real processes, wall-clock time, reports under the configured directory.
    pub fn from_config(config: PipelineConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let build_provider = provider_from_config(&config, Arc::clone(&runner));
        let report_writer = Arc::new(FileReportWriter::new(config.report.resolved_dir()));
        let mut pipeline = Self::new(config, runner, Arc::new(SystemClock), build_provider, report_writer);
        pipeline.verify_tools = true;
        pipeline
    }

    pub fn with_port_locks(mut self, locks: Arc<PortLocks>) -> Self {
        self.port_locks = locks;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn set_active(&self, supervisor: Option<Arc<VirtualDeviceSupervisor>>) {
        *self.active.lock().unwrap_or_else(|p| p.into_inner()) = supervisor;
    }

    fn stage_timeout(&self, kind: StageKind) -> Duration {
        let timeouts = &self.config.stages.timeouts;
        let secs = match kind {
            StageKind::Build => timeouts.build_secs,
            StageKind::StartDevice => timeouts.start_device_secs,
            StageKind::WaitReady => timeouts.wait_ready_secs,
            StageKind::Install => timeouts.install_secs,
            StageKind::Launch => timeouts.launch_secs,
            StageKind::RunChecks => timeouts.run_checks_secs,
            StageKind::GenerateReport => timeouts.generate_report_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    fn is_skipped(&self, kind: StageKind) -> bool {
        let stages = &self.config.stages;
        match kind {
            StageKind::Install => stages.skip_install,
            StageKind::Launch => stages.skip_launch,
            StageKind::RunChecks => stages.skip_checks,
            _ => false,
        }
    }

    fn stage(&self, kind: StageKind, ctx: &RunContext) -> Stage {
        let timeout = self.stage_timeout(kind);
        let trace_id = ctx.trace_id.clone();
        let supervisor = Arc::clone(&ctx.supervisor);
        match kind {
            StageKind::Build => {
                let provider = Arc::clone(&self.build_provider);
                let slot = Arc::clone(&ctx.artifact);
                Stage::new(kind, timeout, move || {
                    let output = provider.build(&trace_id)?;
                    if !output.success {
                        return Ok(StageOutcome::failure(output.detail));
                    }
                    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(output.artifact_path);
                    Ok(StageOutcome::success(output.detail))
                })
            }
            StageKind::StartDevice => {
                let verify = self.verify_tools;
                let adb = self.adb_program.clone();
                let emulator = self.emulator_program.clone();
                Stage::new(kind, timeout, move || {
                    if verify {
                        validate_program(&adb, "adb", &trace_id)?;
                        validate_program(&emulator, "emulator", &trace_id)?;
                    }
                    let handle = supervisor.start()?;
                    if handle.attached {
                        return Ok(StageOutcome::success(format!(
                            "attached to running {}",
                            handle.serial
                        )));
                    }
                    Ok(StageOutcome::success(format!(
                        "{} started (pid {})",
                        handle.serial,
                        handle.pid.unwrap_or_default()
                    )))
                })
            }
            StageKind::WaitReady => Stage::new(kind, timeout, move || {
                let boot = supervisor.wait_ready()?;
                Ok(StageOutcome::success(format!(
                    "ready after {:.1}s ({} polls)",
                    boot.elapsed.as_secs_f64(),
                    boot.attempts
                )))
            }),
            StageKind::Install => {
                let bridge = ctx.bridge.clone();
                let slot = Arc::clone(&ctx.artifact);
                let clock = Arc::clone(&self.clock);
                let settle = Duration::from_millis(self.config.settle.after_install_ms);
                Stage::new(kind, timeout, move || {
                    ensure_device_ready(&supervisor, &trace_id)?;
                    let artifact = slot
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .clone()
                        .ok_or_else(|| AppError::validation("no artifact to install", &trace_id))?;
                    bridge.install(&supervisor.serial(), &artifact)?;
                    clock.sleep(settle);
                    Ok(StageOutcome::success(format!("installed {}", artifact.display())))
                })
            }
            StageKind::Launch => {
                let bridge = ctx.bridge.clone();
                let clock = Arc::clone(&self.clock);
                let settle = Duration::from_millis(self.config.settle.after_launch_ms);
                let package = self.config.app.package_name.clone();
                let activity = self.config.app.activity_name.clone();
                Stage::new(kind, timeout, move || {
                    ensure_device_ready(&supervisor, &trace_id)?;
                    bridge.start_activity(&supervisor.serial(), &package, &activity)?;
                    clock.sleep(settle);
                    Ok(StageOutcome::success(format!("started {package}/{activity}")))
                })
            }
            StageKind::RunChecks => {
                let suite = CheckSuite::new(
                    ctx.bridge.clone(),
                    Arc::clone(&self.clock),
                    supervisor.serial(),
                    self.config.app.package_name.clone(),
                    self.config.checks.clone(),
                    Duration::from_millis(self.config.settle.between_checks_ms),
                    self.config.report.resolved_dir().join("screenshots"),
                );
                let log = ctx.results.clone();
                Stage::new(kind, timeout, move || {
                    if !supervisor.health_check() {
                        warn!(trace_id = %trace_id, "device not healthy before checks");
                    }
                    suite.run_all(&log);
                    let results = log.snapshot();
                    let passed = results.iter().filter(|result| result.passed).count();
                    let mean = if results.is_empty() {
                        0.0
                    } else {
                        results.iter().map(|result| result.score).sum::<f64>() / results.len() as f64
                    };
                    Ok(StageOutcome::scored(
                        passed == results.len(),
                        mean,
                        format!("{passed}/{} checks passed", results.len()),
                    ))
                })
            }
            // Written by `generate_report` once the device is down.
            StageKind::GenerateReport => Stage::new(kind, timeout, || {
                Ok(StageOutcome::failure("report is generated after cleanup"))
            }),
        }
    }

    /// One full pass through every stage. Always returns a report; the device
    /// is stopped before the report is written.
    pub fn run_once(&self) -> Report {
        let trace_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline_run", trace_id = %trace_id);
        let _entered = span.enter();

        let started_at = Local::now();
        let started = self.clock.now();
        let port = self.config.device.port;
        let _permit = self.port_locks.acquire(port);
        info!(trace_id = %trace_id, port, avd = %self.config.device.avd_name, "run started");

        let bridge = DeviceBridge::new(
            Arc::clone(&self.runner),
            self.adb_program.clone(),
            &self.config.command,
            trace_id.clone(),
        );
        let supervisor = Arc::new(VirtualDeviceSupervisor::new(
            Arc::clone(&self.runner),
            bridge.clone(),
            Arc::clone(&self.clock),
            self.emulator_program.clone(),
            self.config.device.clone(),
        ));
        self.set_active(Some(Arc::clone(&supervisor)));
        let lease = DeviceLease::new(Arc::clone(&supervisor));
        let ctx = RunContext {
            trace_id: trace_id.clone(),
            bridge,
            supervisor: Arc::clone(&supervisor),
            artifact: Arc::default(),
            results: ResultLog::default(),
        };

        let executor = StageExecutor::new(trace_id.clone());
        let mut stages = Vec::with_capacity(StageKind::ORDER.len());
        let mut terminal_error: Option<String> = None;
        for kind in StageKind::ORDER {
            if kind == StageKind::GenerateReport {
                continue;
            }
            if terminal_error.is_some() {
                stages.push(StageRecord::not_run(kind));
                continue;
            }
            if self.is_skipped(kind) {
                info!(trace_id = %trace_id, stage = kind.name(), "stage skipped");
                stages.push(StageRecord::skipped(kind));
                continue;
            }
            let outcome = executor.execute(self.stage(kind, &ctx));
            if !outcome.succeeded && kind.aborts_on_failure() {
                warn!(trace_id = %trace_id, stage = kind.name(), detail = %outcome.detail, "aborting run");
                terminal_error = Some(kind.failure_message().to_string());
            }
            stages.push(record(kind, &outcome));
        }

        if let Err(err) = lease.release() {
            warn!(trace_id = %trace_id, error = %err, "device stop incomplete");
            terminal_error = Some(match terminal_error {
                Some(existing) => format!("{existing}; {}", err.error),
                None => err.error,
            });
        }
        self.set_active(None);

        let mut report = Report {
            trace_id: trace_id.clone(),
            started_at: started_at.to_rfc3339(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            avd_name: self.config.device.avd_name.clone(),
            device_serial: supervisor.serial(),
            package_name: self.config.app.package_name.clone(),
            stages,
            results: ctx.results.snapshot(),
            duration_ms: self.clock.now().saturating_duration_since(started).as_millis(),
            boot_wait_ms: supervisor.boot_report().map(|boot| boot.elapsed.as_millis()),
            terminal_error,
            report_path: None,
        };
        self.generate_report(&executor, &mut report, &started_at);

        let summary = report.summary();
        info!(
            trace_id = %trace_id,
            success = summary.success,
            passed = summary.passed,
            failed = summary.failed,
            duration_ms = report.duration_ms as u64,
            "run finished"
        );
        report
    }

    fn generate_report(&self, executor: &StageExecutor, report: &mut Report, started_at: &DateTime<Local>) {
        let kind = StageKind::GenerateReport;
        let writer = Arc::clone(&self.report_writer);
        let snapshot = report.clone();
        let file_name = report_file_name(started_at, &report.trace_id);
        let written: PathSlot = Arc::default();
        let slot = Arc::clone(&written);
        let stage = Stage::new(kind, self.stage_timeout(kind), move || {
            let path = writer.write(&snapshot, &file_name)?;
            let detail = path.display().to_string();
            *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(path);
            Ok(StageOutcome::success(detail))
        });
        let outcome = executor.execute(stage);
        if !outcome.succeeded {
            warn!(trace_id = %report.trace_id, detail = %outcome.detail, "report not written");
        }
        report.stages.push(record(kind, &outcome));
        report.report_path = written.lock().unwrap_or_else(|p| p.into_inner()).clone();
    }

    /// Repeats `run_once` every `interval` until `stop` is set or `max_runs`
    /// runs have finished. Returns the number of runs.
    pub fn run_continuously<F>(
        &self,
        interval: Duration,
        stop: &AtomicBool,
        max_runs: Option<usize>,
        mut on_report: F,
    ) -> usize
    where
        F: FnMut(&Report),
    {
        let mut runs = 0usize;
        while !stop.load(Ordering::SeqCst) {
            let report = self.run_once();
            runs += 1;
            on_report(&report);
            if max_runs.is_some_and(|max| runs >= max) {
                break;
            }
            self.wait_interval(interval, stop);
        }
        runs
    }

    /// An interval too large to represent waits for `stop` alone.
    fn wait_interval(&self, interval: Duration, stop: &AtomicBool) {
        let deadline = self.clock.now().checked_add(interval);
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let now = self.clock.now();
            let step = match deadline {
                Some(deadline) if now >= deadline => return,
                Some(deadline) => (deadline - now).min(STOP_POLL),
                None => STOP_POLL,
            };
            self.clock.sleep(step);
        }
    }

    /// Stops the device owned by an in-flight run, if any. The run keeps going
    /// and records the remaining stages as failed.
    pub fn stop_active_device(&self) -> Result<bool, AppError> {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let Some(supervisor) = active else {
            return Ok(false);
        };
        let was_running = supervisor.is_running();
        supervisor.retire();
        supervisor.stop()?;
        Ok(was_running)
    }

    /// Stops the device of an in-flight run, or asks an attached emulator on
    /// the configured port to exit. Returns whether anything was stopped.
    pub fn stop_device_if_running(&self) -> Result<bool, AppError> {
        if self.active.lock().unwrap_or_else(|p| p.into_inner()).is_some() {
            return self.stop_active_device();
        }

        let trace_id = Uuid::new_v4().to_string();
        check_device_port(&self.config.device, &trace_id)?;
        let bridge = DeviceBridge::new(
            Arc::clone(&self.runner),
            self.adb_program.clone(),
            &self.config.command,
            trace_id.clone(),
        );
        let serial = self.config.device.serial();
        let attached = bridge
            .list_devices()?
            .iter()
            .any(|device| device.serial == serial);
        if !attached {
            info!(trace_id = %trace_id, serial = %serial, "no device running");
            return Ok(false);
        }
        info!(trace_id = %trace_id, serial = %serial, "stopping attached device");
        bridge.kill_emulator(&serial)?;
        Ok(true)
    }
}

fn ensure_device_ready(supervisor: &VirtualDeviceSupervisor, trace_id: &str) -> Result<(), AppError> {
    if supervisor.health_check() {
        return Ok(());
    }
    Err(AppError::dependency(
        format!("{} is not ready ({:?})", supervisor.serial(), supervisor.state()),
        trace_id,
    ))
}

fn record(kind: StageKind, outcome: &StageOutcome) -> StageRecord {
    StageRecord {
        kind,
        status: if outcome.succeeded {
            StageStatus::Passed
        } else {
            StageStatus::Failed
        },
        score: outcome.score,
        detail: outcome.detail.clone(),
        duration_ms: outcome.duration.as_millis(),
    }
}
