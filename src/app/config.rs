use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "EMU_HARNESS_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SdkSettings {
    /// Android SDK root. Empty falls back to `ANDROID_SDK_ROOT` / `ANDROID_HOME`.
    pub sdk_path: String,
    pub adb_path: String,
    pub emulator_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub avd_name: String,
    pub port: u16,
    pub headless: bool,
    pub no_audio: bool,
    pub extra_args: String,
    pub boot_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub require_boot_completed: bool,
    /// Adopt an emulator already attached on `port` instead of refusing the run.
    pub reuse_running: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            avd_name: "Pixel_7_API_33".to_string(),
            port: 5554,
            headless: true,
            no_audio: true,
            extra_args: String::new(),
            boot_timeout_secs: 120,
            poll_interval_secs: 2,
            require_boot_completed: true,
            reuse_running: false,
        }
    }
}

impl DeviceSettings {
    pub fn serial(&self) -> String {
        format!("emulator-{}", self.port)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// The emulator console only listens on even ports from 5554 upward; any
/// other value would address a different device than the one named.
pub fn check_device_port(settings: &DeviceSettings, trace_id: &str) -> Result<(), AppError> {
    if settings.port < 5554 || settings.port % 2 != 0 {
        return Err(AppError::validation(
            format!(
                "invalid emulator port {}: must be an even number >= 5554",
                settings.port
            ),
            trace_id,
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub package_name: String,
    pub activity_name: String,
    pub artifact_path: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            package_name: "com.yourcompany.adventuregame".to_string(),
            activity_name: "com.unity3d.player.UnityPlayerActivity".to_string(),
            artifact_path: "Builds/Android/AdventureGame.apk".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BuildSettings {
    /// External build command. Empty means the artifact is expected to exist already.
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageTimeouts {
    pub build_secs: u64,
    pub start_device_secs: u64,
    pub wait_ready_secs: u64,
    pub install_secs: u64,
    pub launch_secs: u64,
    pub run_checks_secs: u64,
    pub generate_report_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            build_secs: 1800,
            start_device_secs: 60,
            wait_ready_secs: 150,
            install_secs: 240,
            launch_secs: 60,
            run_checks_secs: 300,
            generate_report_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StageSettings {
    pub skip_build: bool,
    pub skip_install: bool,
    pub skip_launch: bool,
    pub skip_checks: bool,
    pub timeouts: StageTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettleSettings {
    pub after_install_ms: u64,
    pub after_launch_ms: u64,
    pub between_checks_ms: u64,
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            after_install_ms: 2000,
            after_launch_ms: 3000,
            between_checks_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckSettings {
    pub min_fps: f64,
    pub target_fps: f64,
    pub perf_window_secs: u64,
    pub memory_ceiling_mb: f64,
    pub stability_window_secs: u64,
    pub stability_interval_secs: u64,
    pub tap_x: u32,
    pub tap_y: u32,
    pub capture_screenshot: bool,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            min_fps: 30.0,
            target_fps: 60.0,
            perf_window_secs: 5,
            memory_ceiling_mb: 200.0,
            stability_window_secs: 10,
            stability_interval_secs: 2,
            tap_x: 500,
            tap_y: 500,
            capture_screenshot: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub command_timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            install_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ReportSettings {
    /// Directory for report files. Empty resolves to `./reports`.
    pub output_dir: String,
}

impl ReportSettings {
    pub fn resolved_dir(&self) -> PathBuf {
        let trimmed = self.output_dir.trim();
        if trimmed.is_empty() {
            PathBuf::from("reports")
        } else {
            PathBuf::from(trimmed)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sdk: SdkSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub stages: StageSettings,
    #[serde(default)]
    pub settle: SettleSettings,
    #[serde(default)]
    pub checks: CheckSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".emu_harness.json")
}

pub fn load_config() -> Result<PipelineConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<PipelineConfig, AppError> {
    if !path.exists() {
        return Ok(PipelineConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: PipelineConfig = serde_json::from_str(&raw).map_err(|err| {
        AppError::validation(format!("Failed to parse config {}: {err}", path.display()), "")
    })?;
    check_device_port(&config.device, "")?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(config: &PipelineConfig, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

pub fn validate_config(mut config: PipelineConfig) -> PipelineConfig {
    let device_defaults = DeviceSettings::default();
    let check_defaults = CheckSettings::default();
    let timeout_defaults = StageTimeouts::default();

    if config.device.avd_name.trim().is_empty() {
        config.device.avd_name = device_defaults.avd_name;
    }
    if config.device.boot_timeout_secs == 0 {
        config.device.boot_timeout_secs = device_defaults.boot_timeout_secs;
    }
    if config.device.poll_interval_secs == 0 {
        config.device.poll_interval_secs = device_defaults.poll_interval_secs;
    }

    if config.checks.min_fps.is_nan() || config.checks.min_fps <= 0.0 {
        config.checks.min_fps = check_defaults.min_fps;
    }
    if config.checks.target_fps.is_nan() || config.checks.target_fps < config.checks.min_fps {
        config.checks.target_fps = config.checks.min_fps.max(check_defaults.target_fps);
    }
    if config.checks.perf_window_secs == 0 {
        config.checks.perf_window_secs = check_defaults.perf_window_secs;
    }
    if config.checks.memory_ceiling_mb.is_nan() || config.checks.memory_ceiling_mb <= 0.0 {
        config.checks.memory_ceiling_mb = check_defaults.memory_ceiling_mb;
    }
    if config.checks.stability_interval_secs == 0 {
        config.checks.stability_interval_secs = check_defaults.stability_interval_secs;
    }
    if config.checks.stability_window_secs < config.checks.stability_interval_secs {
        config.checks.stability_window_secs = config.checks.stability_interval_secs;
    }

    if config.command.command_timeout_secs == 0 {
        config.command.command_timeout_secs = CommandSettings::default().command_timeout_secs;
    }
    if config.command.install_timeout_secs == 0 {
        config.command.install_timeout_secs = CommandSettings::default().install_timeout_secs;
    }

    let timeouts = &mut config.stages.timeouts;
    for (value, fallback) in [
        (&mut timeouts.build_secs, timeout_defaults.build_secs),
        (&mut timeouts.start_device_secs, timeout_defaults.start_device_secs),
        (&mut timeouts.install_secs, timeout_defaults.install_secs),
        (&mut timeouts.launch_secs, timeout_defaults.launch_secs),
        (&mut timeouts.run_checks_secs, timeout_defaults.run_checks_secs),
        (&mut timeouts.generate_report_secs, timeout_defaults.generate_report_secs),
    ] {
        if *value == 0 {
            *value = fallback;
        }
    }
    // The boot poll carries its own deadline; the stage must outlive it.
    let min_wait_ready = config
        .device
        .boot_timeout_secs
        .saturating_add(config.device.poll_interval_secs.saturating_mul(2));
    if timeouts.wait_ready_secs < min_wait_ready {
        timeouts.wait_ready_secs = min_wait_ready;
    }

    config
}
