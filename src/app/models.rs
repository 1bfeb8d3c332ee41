use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Build,
    StartDevice,
    WaitReady,
    Install,
    Launch,
    RunChecks,
    GenerateReport,
}

impl StageKind {
    pub const ORDER: [StageKind; 7] = [
        StageKind::Build,
        StageKind::StartDevice,
        StageKind::WaitReady,
        StageKind::Install,
        StageKind::Launch,
        StageKind::RunChecks,
        StageKind::GenerateReport,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::Build => "Build",
            StageKind::StartDevice => "StartDevice",
            StageKind::WaitReady => "WaitReady",
            StageKind::Install => "Install",
            StageKind::Launch => "Launch",
            StageKind::RunChecks => "RunChecks",
            StageKind::GenerateReport => "GenerateReport",
        }
    }

    /// Setup stages: a failure here makes the rest of the run meaningless.
    pub fn aborts_on_failure(self) -> bool {
        matches!(
            self,
            StageKind::Build
                | StageKind::StartDevice
                | StageKind::WaitReady
                | StageKind::Install
                | StageKind::Launch
        )
    }

    /// Message recorded as the run's terminal error when this stage aborts the run.
    pub fn failure_message(self) -> &'static str {
        match self {
            StageKind::Build => "build failed",
            StageKind::StartDevice => "device start failed",
            StageKind::WaitReady => "device boot failed",
            StageKind::Install => "install failed",
            StageKind::Launch => "launch failed",
            StageKind::RunChecks => "checks failed",
            StageKind::GenerateReport => "report generation failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
    NotRun,
}

impl StageStatus {
    pub fn label(self) -> &'static str {
        match self {
            StageStatus::Passed => "PASS",
            StageStatus::Failed => "FAIL",
            StageStatus::Skipped => "SKIPPED",
            StageStatus::NotRun => "NOT RUN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub kind: StageKind,
    pub status: StageStatus,
    pub score: f64,
    pub detail: String,
    pub duration_ms: u128,
}

impl StageRecord {
    pub fn not_run(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::NotRun,
            score: 0.0,
            detail: String::new(),
            duration_ms: 0,
        }
    }

    pub fn skipped(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Skipped,
            score: 0.0,
            detail: "skipped by configuration".to_string(),
            duration_ms: 0,
        }
    }
}

/// One check's verdict. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub score: f64,
    pub detail: String,
    pub timestamp: String,
}

impl TestResult {
    pub fn new(name: impl Into<String>, passed: bool, score: f64, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed,
            score: clamp_score(score),
            detail: detail.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn pass(name: impl Into<String>, score: f64, detail: impl Into<String>) -> Self {
        Self::new(name, true, score, detail)
    }

    pub fn fail(name: impl Into<String>, score: f64, detail: impl Into<String>) -> Self {
        Self::new(name, false, score, detail)
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}
