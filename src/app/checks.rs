use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::parse::process_listed;
use crate::app::adb::paths::sanitize_filename_component;
use crate::app::clock::Clock;
use crate::app::config::CheckSettings;
use crate::app::error::AppError;
use crate::app::models::TestResult;
use crate::app::perf::parse::{
    frames_per_second, kb_to_mb, memory_score, parse_gfxinfo_total_frames,
    parse_meminfo_total_pss_kb, performance_score,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Liveness,
    Input,
    Performance,
    Memory,
    Stability,
    Screenshot,
}

impl CheckKind {
    pub fn name(self) -> &'static str {
        match self {
            CheckKind::Liveness => "App Liveness",
            CheckKind::Input => "Input Simulation",
            CheckKind::Performance => "Performance",
            CheckKind::Memory => "Memory Usage",
            CheckKind::Stability => "Stability",
            CheckKind::Screenshot => "Screenshot",
        }
    }
}

/// Append-only results shared with the stage thread, so checks finished
/// before a stage timeout still reach the report.
#[derive(Clone, Default)]
pub struct ResultLog {
    inner: Arc<Mutex<Vec<TestResult>>>,
}

impl ResultLog {
    pub fn push(&self, result: TestResult) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(result);
    }

    pub fn snapshot(&self) -> Vec<TestResult> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

pub struct CheckSuite {
    bridge: DeviceBridge,
    clock: Arc<dyn Clock>,
    serial: String,
    package: String,
    settings: CheckSettings,
    between_checks: Duration,
    screenshot_dir: PathBuf,
}

impl CheckSuite {
    pub fn new(
        bridge: DeviceBridge,
        clock: Arc<dyn Clock>,
        serial: impl Into<String>,
        package: impl Into<String>,
        settings: CheckSettings,
        between_checks: Duration,
        screenshot_dir: PathBuf,
    ) -> Self {
        Self {
            bridge,
            clock,
            serial: serial.into(),
            package: package.into(),
            settings,
            between_checks,
            screenshot_dir,
        }
    }

    pub fn kinds(&self) -> Vec<CheckKind> {
        let mut kinds = vec![
            CheckKind::Liveness,
            CheckKind::Input,
            CheckKind::Performance,
            CheckKind::Memory,
            CheckKind::Stability,
        ];
        if self.settings.capture_screenshot {
            kinds.push(CheckKind::Screenshot);
        }
        kinds
    }

    /// Runs every check in order, one at a time, with a settle delay between them.
    pub fn run_all(&self, log: &ResultLog) {
        let kinds = self.kinds();
        for (index, kind) in kinds.iter().enumerate() {
            if index > 0 {
                self.clock.sleep(self.between_checks);
            }
            let result = self.run(*kind);
            info!(
                trace_id = %self.bridge.trace_id(),
                check = kind.name(),
                passed = result.passed,
                score = result.score,
                "check finished"
            );
            log.push(result);
        }
    }

    pub fn run(&self, kind: CheckKind) -> TestResult {
        let outcome = match kind {
            CheckKind::Liveness => self.liveness(),
            CheckKind::Input => self.input(),
            CheckKind::Performance => self.performance(),
            CheckKind::Memory => self.memory(),
            CheckKind::Stability => self.stability(),
            CheckKind::Screenshot => self.screenshot(),
        };
        outcome.unwrap_or_else(|err| TestResult::fail(kind.name(), 0.0, err.error))
    }

    fn is_app_running(&self) -> Result<bool, AppError> {
        let listing = self.bridge.process_list(&self.serial)?;
        Ok(process_listed(&listing, &self.package))
    }

    fn liveness(&self) -> Result<TestResult, AppError> {
        let name = CheckKind::Liveness.name();
        if self.is_app_running()? {
            Ok(TestResult::pass(name, 100.0, format!("{} is running", self.package)))
        } else {
            Ok(TestResult::fail(name, 0.0, format!("{} not found in process list", self.package)))
        }
    }

    // Passing only means the tap was accepted; the app's reaction is not observed.
    fn input(&self) -> Result<TestResult, AppError> {
        let (x, y) = (self.settings.tap_x, self.settings.tap_y);
        self.bridge.tap(&self.serial, x, y)?;
        Ok(TestResult::pass(
            CheckKind::Input.name(),
            100.0,
            format!("tap accepted at ({x}, {y}); app reaction not verified"),
        ))
    }

    fn performance(&self) -> Result<TestResult, AppError> {
        let name = CheckKind::Performance.name();
        let window = Duration::from_secs(self.settings.perf_window_secs.max(1));
        self.bridge
            .shell(&self.serial, &["dumpsys", "gfxinfo", &self.package, "reset"])?;
        self.clock.sleep(window);
        let output = self
            .bridge
            .shell(&self.serial, &["dumpsys", "gfxinfo", &self.package])?;
        let Some(frames) = parse_gfxinfo_total_frames(&output) else {
            return Ok(TestResult::fail(
                name,
                0.0,
                format!("no frame statistics for {}", self.package),
            ));
        };
        let fps = frames_per_second(frames, window);
        let score = performance_score(fps, self.settings.target_fps);
        let detail = format!(
            "Average FPS: {fps:.1} ({frames} frames over {}s, min {:.0})",
            window.as_secs(),
            self.settings.min_fps
        );
        Ok(TestResult::new(name, fps >= self.settings.min_fps, score, detail))
    }

    fn memory(&self) -> Result<TestResult, AppError> {
        let name = CheckKind::Memory.name();
        let output = self
            .bridge
            .shell(&self.serial, &["dumpsys", "meminfo", &self.package])?;
        let Some(pss_kb) = parse_meminfo_total_pss_kb(&output) else {
            return Ok(TestResult::fail(
                name,
                0.0,
                format!("no memory statistics for {}", self.package),
            ));
        };
        let used_mb = kb_to_mb(pss_kb);
        let ceiling = self.settings.memory_ceiling_mb;
        let detail = format!("Memory Usage: {used_mb:.1}MB (ceiling {ceiling:.0}MB)");
        Ok(TestResult::new(
            name,
            used_mb < ceiling,
            memory_score(used_mb, ceiling),
            detail,
        ))
    }

    /// Re-polls liveness across the window; the first miss ends the check.
    fn stability(&self) -> Result<TestResult, AppError> {
        let name = CheckKind::Stability.name();
        let window = Duration::from_secs(self.settings.stability_window_secs);
        let interval = Duration::from_secs(self.settings.stability_interval_secs.max(1));
        let start = self.clock.now();
        let mut polls = 0u32;
        loop {
            let elapsed = self.clock.now().saturating_duration_since(start);
            if polls > 0 && elapsed >= window {
                break;
            }
            polls += 1;
            let running = match self.is_app_running() {
                Ok(running) => running,
                Err(err) => {
                    warn!(trace_id = %self.bridge.trace_id(), error = %err, "stability poll failed");
                    false
                }
            };
            if !running {
                return Ok(TestResult::fail(
                    name,
                    0.0,
                    format!(
                        "{} disappeared after {}s (poll {polls})",
                        self.package,
                        elapsed.as_secs()
                    ),
                ));
            }
            self.clock.sleep(interval.min(window.saturating_sub(elapsed)));
        }
        Ok(TestResult::pass(
            name,
            100.0,
            format!("{} stayed alive for {}s ({polls} polls)", self.package, window.as_secs()),
        ))
    }

    fn screenshot(&self) -> Result<TestResult, AppError> {
        let file_name = format!(
            "test_screenshot_{}_{}.png",
            sanitize_filename_component(&self.serial),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let remote = format!("/sdcard/{file_name}");
        self.bridge.screencap(&self.serial, &remote)?;
        let pulled = self.bridge.pull_file(&self.serial, &remote, &self.screenshot_dir);
        if let Err(err) = self.bridge.remove_file(&self.serial, &remote) {
            warn!(trace_id = %self.bridge.trace_id(), error = %err, "failed to remove remote screenshot");
        }
        let local = pulled?;
        Ok(TestResult::pass(
            CheckKind::Screenshot.name(),
            100.0,
            format!("saved {}", local.display()),
        ))
    }
}
