use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::error::AppError;
use crate::app::models::{StageKind, StageRecord, StageStatus, TestResult};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Report {
    pub trace_id: String,
    pub started_at: String,
    pub platform: String,
    pub avd_name: String,
    pub device_serial: String,
    pub package_name: String,
    pub stages: Vec<StageRecord>,
    pub results: Vec<TestResult>,
    pub duration_ms: u128,
    pub boot_wait_ms: Option<u128>,
    pub terminal_error: Option<String>,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ReportSummary {
    pub passed: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub overall_score: Option<f64>,
    pub success: bool,
}

impl Report {
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|result| result.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.passed_count()
    }

    /// passed / (passed + failed) as a percentage; 0 when nothing ran.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.passed_count() as f64 / self.results.len() as f64 * 100.0
    }

    /// Arithmetic mean of check scores.
    pub fn overall_score(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }
        let total: f64 = self.results.iter().map(|result| result.score).sum();
        Some(total / self.results.len() as f64)
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.kind == kind)
    }

    pub fn stage_status(&self, kind: StageKind) -> StageStatus {
        self.stage(kind)
            .map(|record| record.status)
            .unwrap_or(StageStatus::NotRun)
    }

    /// No terminal error, no failed stage and no failed check. Writing the
    /// report file does not count.
    pub fn is_success(&self) -> bool {
        self.terminal_error.is_none()
            && self.failed_count() == 0
            && self
                .stages
                .iter()
                .filter(|record| record.kind != StageKind::GenerateReport)
                .all(|record| record.status != StageStatus::Failed)
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            passed: self.passed_count(),
            failed: self.failed_count(),
            success_rate: self.success_rate(),
            overall_score: self.overall_score(),
            success: self.is_success(),
        }
    }
}

pub fn report_file_name(started_at: &DateTime<Local>, trace_id: &str) -> String {
    let short: String = sanitize_filename_component(trace_id).chars().take(8).collect();
    format!(
        "device_test_report_{}_{short}.txt",
        started_at.format("%Y%m%d_%H%M%S")
    )
}

pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== DEVICE TEST REPORT ===");
    let _ = writeln!(out, "Trace ID: {}", report.trace_id);
    let _ = writeln!(out, "Started: {}", report.started_at);
    let _ = writeln!(out, "Platform: {}", report.platform);
    let _ = writeln!(out, "Device: {} ({})", report.device_serial, report.avd_name);
    let _ = writeln!(out, "Package: {}", report.package_name);
    let _ = writeln!(
        out,
        "Total Duration: {:.1} seconds",
        report.duration_ms as f64 / 1000.0
    );
    if let Some(boot_ms) = report.boot_wait_ms {
        let _ = writeln!(out, "Boot Wait: {:.1} seconds", boot_ms as f64 / 1000.0);
    }
    let _ = writeln!(
        out,
        "Result: {}",
        if report.is_success() { "PASSED" } else { "FAILED" }
    );
    if let Some(error) = &report.terminal_error {
        let _ = writeln!(out, "Terminal Error: {error}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "--- Stages ---");
    for record in &report.stages {
        let _ = write!(out, "{:<15} {}", record.kind.name(), record.status.label());
        if !record.detail.is_empty() {
            let _ = write!(out, "  {}", record.detail);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "--- Checks ---");
    if report.results.is_empty() {
        let _ = writeln!(out, "(no checks ran)");
    }
    for result in &report.results {
        let _ = writeln!(out, "Test: {}", result.name);
        let _ = writeln!(
            out,
            "Status: {}",
            if result.passed { "PASSED" } else { "FAILED" }
        );
        let _ = writeln!(out, "Score: {:.1}%", result.score);
        let _ = writeln!(out, "Details: {}", result.detail);
        let _ = writeln!(out, "Time: {}", result.timestamp);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "--- Summary ---");
    let _ = writeln!(out, "Passed: {}", report.passed_count());
    let _ = writeln!(out, "Failed: {}", report.failed_count());
    let _ = writeln!(out, "Success Rate: {:.1}%", report.success_rate());
    match report.overall_score() {
        Some(score) => {
            let _ = writeln!(out, "Overall Score: {score:.1}");
        }
        None => {
            let _ = writeln!(out, "Overall Score: n/a");
        }
    }
    out
}

pub trait ReportWriter: Send + Sync {
    fn write(&self, report: &Report, file_name: &str) -> Result<PathBuf, AppError>;
}

pub struct FileReportWriter {
    dir: PathBuf,
}

impl FileReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ReportWriter for FileReportWriter {
    fn write(&self, report: &Report, file_name: &str) -> Result<PathBuf, AppError> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::system(format!("Failed to create report dir: {err}"), &report.trace_id)
        })?;
        let path = self.dir.join(file_name);
        fs::write(&path, render_text(report)).map_err(|err| {
            AppError::system(
                format!("Failed to write report {}: {err}", path.display()),
                &report.trace_id,
            )
        })?;
        info!(trace_id = %report.trace_id, path = %path.display(), "report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn result(name: &str, passed: bool, score: f64) -> TestResult {
        TestResult::new(name, passed, score, "detail")
    }

    fn report(results: Vec<TestResult>) -> Report {
        Report {
            trace_id: "0f8c2a41-aaaa-bbbb-cccc-1234567890ab".to_string(),
            started_at: "2026-10-15T10:00:00+00:00".to_string(),
            platform: "linux/x86_64".to_string(),
            avd_name: "Pixel_7_API_33".to_string(),
            device_serial: "emulator-5554".to_string(),
            package_name: "com.example.game".to_string(),
            stages: vec![
                StageRecord {
                    kind: StageKind::Build,
                    status: StageStatus::Passed,
                    score: 100.0,
                    detail: "using prebuilt".to_string(),
                    duration_ms: 3,
                },
                StageRecord::not_run(StageKind::Launch),
            ],
            results,
            duration_ms: 61_500,
            boot_wait_ms: Some(40_000),
            terminal_error: None,
            report_path: None,
        }
    }

    #[test]
    fn mean_score_and_success_rate() {
        let report = report(vec![
            result("a", true, 100.0),
            result("b", true, 100.0),
            result("c", true, 80.0),
            result("d", true, 90.0),
            result("e", true, 100.0),
        ]);
        assert_eq!(report.overall_score(), Some(94.0));
        assert_eq!(report.success_rate(), 100.0);
        assert!(report.is_success());
    }

    #[test]
    fn empty_report_has_no_score() {
        let mut report = report(Vec::new());
        report.terminal_error = Some("build failed".to_string());
        assert_eq!(report.overall_score(), None);
        assert_eq!(report.success_rate(), 0.0);
        assert!(!report.is_success());
        assert_eq!(report.stage_status(StageKind::Launch), StageStatus::NotRun);
        assert_eq!(report.stage_status(StageKind::RunChecks), StageStatus::NotRun);
    }

    #[test]
    fn failed_check_fails_run() {
        let report = report(vec![result("a", true, 100.0), result("b", false, 0.0)]);
        assert_eq!(report.success_rate(), 50.0);
        assert!(!report.is_success());
    }

    #[test]
    fn renders_stages_checks_and_summary() {
        let mut report = report(vec![result("Memory Usage", false, 12.5)]);
        report.terminal_error = Some("install failed".to_string());
        let text = render_text(&report);
        assert!(text.contains("Platform: linux/x86_64"));
        assert!(text.contains("Boot Wait: 40.0 seconds"));
        assert!(text.contains("Terminal Error: install failed"));
        assert!(text.contains("Launch          NOT RUN"));
        assert!(text.contains("Test: Memory Usage\nStatus: FAILED\nScore: 12.5%"));
        assert!(text.contains("Success Rate: 0.0%"));
    }

    #[test]
    fn file_name_uses_timestamp_and_trace_prefix() {
        let started = Local.with_ymd_and_hms(2026, 10, 15, 9, 30, 5).single().expect("time");
        assert_eq!(
            report_file_name(&started, "0f8c2a41-aaaa"),
            "device_test_report_20261015_093005_0f8c2a41.txt"
        );
    }

    #[test]
    fn writer_creates_directory() {
        let dir = tempfile::TempDir::new().expect("tmp");
        let writer = FileReportWriter::new(dir.path().join("reports"));
        let report = report(vec![result("a", true, 100.0)]);
        let path = writer.write(&report, "r.txt").expect("write");
        let text = fs::read_to_string(path).expect("read");
        assert!(text.contains("=== DEVICE TEST REPORT ==="));
    }
}
