use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::adb::parse::{activity_started, install_succeeded, parse_adb_devices, parse_boot_completed};
use crate::app::adb::paths::{device_file_name, validate_device_path};
use crate::app::adb::runner::{CommandInvocation, CommandOutput, CommandRunner};
use crate::app::config::CommandSettings;
use crate::app::error::AppError;
use crate::app::models::DeviceSummary;

/// Device-targeted adb verbs. Each verb is one synchronous command; success is
/// decided by exit code plus the verb's output marker and the raw output is
/// carried in the error for the caller to diagnose.
#[derive(Clone)]
pub struct DeviceBridge {
    runner: Arc<dyn CommandRunner>,
    program: String,
    command_timeout: Duration,
    install_timeout: Duration,
    trace_id: String,
}

impl DeviceBridge {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: impl Into<String>,
        settings: &CommandSettings,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            command_timeout: Duration::from_secs(settings.command_timeout_secs.max(1)),
            install_timeout: Duration::from_secs(settings.install_timeout_secs.max(1)),
            trace_id: trace_id.into(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn invocation(&self, serial: Option<&str>, args: &[&str]) -> CommandInvocation {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = serial {
            full.push("-s".to_string());
            full.push(serial.to_string());
        }
        full.extend(args.iter().map(|arg| arg.to_string()));
        CommandInvocation::new(self.program.clone(), full)
    }

    fn run(&self, serial: Option<&str>, args: &[&str], timeout: Duration) -> Result<CommandOutput, AppError> {
        let invocation = self.invocation(serial, args);
        debug!(trace_id = %self.trace_id, command = %invocation, "adb");
        self.runner.run(&invocation, timeout, &self.trace_id)
    }

    fn run_checked(&self, serial: Option<&str>, args: &[&str], timeout: Duration) -> Result<CommandOutput, AppError> {
        let output = self.run(serial, args, timeout)?;
        if !output.success() {
            return Err(AppError::command_failure(
                format!(
                    "adb {} exited with {:?}: {}",
                    args.first().copied().unwrap_or_default(),
                    output.exit_code,
                    output.combined()
                ),
                &self.trace_id,
            ));
        }
        Ok(output)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceSummary>, AppError> {
        let output = self.run_checked(None, &["devices", "-l"], self.command_timeout)?;
        Ok(parse_adb_devices(&output.stdout))
    }

    pub fn install(&self, serial: &str, package_path: &Path) -> Result<String, AppError> {
        let path = package_path.to_string_lossy().to_string();
        let output = self.run(Some(serial), &["install", "-r", &path], self.install_timeout)?;
        let combined = output.combined();
        if !output.success() || !install_succeeded(&combined) {
            warn!(trace_id = %self.trace_id, serial, exit_code = ?output.exit_code, "install rejected");
            return Err(AppError::command_failure(
                format!("install of {path} failed: {combined}"),
                &self.trace_id,
            ));
        }
        Ok(combined)
    }

    pub fn start_activity(&self, serial: &str, package: &str, activity: &str) -> Result<String, AppError> {
        let component = format!("{package}/{activity}");
        let output = self.run(
            Some(serial),
            &["shell", "am", "start", "-n", &component],
            self.command_timeout,
        )?;
        let combined = output.combined();
        if !output.success() || !activity_started(&combined) {
            return Err(AppError::command_failure(
                format!("am start {component} failed: {combined}"),
                &self.trace_id,
            ));
        }
        Ok(combined)
    }

    /// Raw stdout of `adb shell <args>`.
    pub fn shell(&self, serial: &str, args: &[&str]) -> Result<String, AppError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        let output = self.run_checked(Some(serial), &full, self.command_timeout)?;
        Ok(output.stdout)
    }

    pub fn pull_file(&self, serial: &str, remote_path: &str, local_dir: &Path) -> Result<PathBuf, AppError> {
        validate_device_path(remote_path).map_err(|err| AppError::validation(err, &self.trace_id))?;
        let file_name = device_file_name(remote_path)
            .ok_or_else(|| AppError::validation("remote path has no file name", &self.trace_id))?
            .to_string();
        fs::create_dir_all(local_dir).map_err(|err| {
            AppError::system(format!("Failed to create output dir: {err}"), &self.trace_id)
        })?;
        let local = local_dir.to_string_lossy().to_string();
        self.run_checked(Some(serial), &["pull", remote_path, &local], self.install_timeout)?;
        Ok(local_dir.join(file_name))
    }

    /// Asks the emulator console to shut down.
    pub fn kill_emulator(&self, serial: &str) -> Result<(), AppError> {
        self.run_checked(Some(serial), &["emu", "kill"], self.command_timeout)?;
        Ok(())
    }

    pub fn boot_completed(&self, serial: &str) -> Result<bool, AppError> {
        let stdout = self.shell(serial, &["getprop", "sys.boot_completed"])?;
        Ok(parse_boot_completed(&stdout))
    }

    pub fn tap(&self, serial: &str, x: u32, y: u32) -> Result<(), AppError> {
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(serial, &["input", "tap", &x, &y])?;
        Ok(())
    }

    pub fn process_list(&self, serial: &str) -> Result<String, AppError> {
        self.shell(serial, &["ps", "-A"])
    }

    pub fn screencap(&self, serial: &str, remote_path: &str) -> Result<(), AppError> {
        validate_device_path(remote_path).map_err(|err| AppError::validation(err, &self.trace_id))?;
        self.shell(serial, &["screencap", "-p", remote_path])?;
        Ok(())
    }

    pub fn remove_file(&self, serial: &str, remote_path: &str) -> Result<(), AppError> {
        validate_device_path(remote_path).map_err(|err| AppError::validation(err, &self.trace_id))?;
        self.shell(serial, &["rm", "-f", remote_path])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{devices_output, exit, ok, FakeRunner};

    fn make_bridge(runner: FakeRunner) -> (DeviceBridge, Arc<FakeRunner>) {
        let runner = Arc::new(runner);
        let bridge = DeviceBridge::new(
            runner.clone(),
            "adb",
            &CommandSettings::default(),
            "trace-bridge",
        );
        (bridge, runner)
    }

    #[test]
    fn targets_serial_on_every_device_verb() {
        let (bridge, runner) = make_bridge(FakeRunner::new(|_| ok("")));
        bridge.tap("emulator-5554", 500, 500).expect("tap");
        bridge.kill_emulator("emulator-5554").expect("kill");
        assert_eq!(
            runner.calls(),
            vec![
                "adb -s emulator-5554 shell input tap 500 500",
                "adb -s emulator-5554 emu kill",
            ]
        );
    }

    #[test]
    fn lists_devices_without_serial() {
        let (bridge, runner) =
            make_bridge(FakeRunner::new(|_| ok(&devices_output(&["emulator-5554"]))));
        let devices = bridge.list_devices().expect("devices");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(runner.calls(), vec!["adb devices -l"]);
    }

    #[test]
    fn install_requires_success_marker() {
        let (bridge, _) = make_bridge(FakeRunner::new(|_| {
            ok("Performing Streamed Install\nFailure [INSTALL_FAILED_INVALID_APK]\n")
        }));
        let err = bridge
            .install("emulator-5554", Path::new("/tmp/game.apk"))
            .unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_COMMAND);
        assert!(err.error.contains("INSTALL_FAILED_INVALID_APK"));

        let (bridge, runner) = make_bridge(FakeRunner::new(|_| ok("Performing Streamed Install\nSuccess\n")));
        bridge
            .install("emulator-5554", Path::new("/tmp/game.apk"))
            .expect("install");
        assert_eq!(runner.calls(), vec!["adb -s emulator-5554 install -r /tmp/game.apk"]);
    }

    #[test]
    fn start_activity_rejects_error_output_with_zero_exit() {
        let (bridge, _) = make_bridge(FakeRunner::new(|_| {
            ok("Starting: Intent { cmp=com.example/.Main }\nError: Activity class does not exist.\n")
        }));
        assert!(bridge
            .start_activity("emulator-5554", "com.example", ".Main")
            .is_err());
    }

    #[test]
    fn shell_failure_carries_raw_output() {
        let (bridge, _) = make_bridge(FakeRunner::new(|_| exit(1, "", "error: device offline")));
        let err = bridge.shell("emulator-5554", &["ps", "-A"]).unwrap_err();
        assert!(err.error.contains("device offline"));
    }

    #[test]
    fn pull_file_validates_remote_path_and_creates_dir() {
        let (bridge, runner) = make_bridge(FakeRunner::new(|_| ok("1 file pulled")));
        let dir = tempfile::TempDir::new().expect("tmp");
        let target = dir.path().join("shots");
        assert!(bridge.pull_file("emulator-5554", "../etc", &target).is_err());
        assert!(runner.calls().is_empty());

        let pulled = bridge
            .pull_file("emulator-5554", "/sdcard/shot.png", &target)
            .expect("pull");
        assert!(target.is_dir());
        assert_eq!(pulled, target.join("shot.png"));
    }

    #[test]
    fn boot_completed_reads_getprop() {
        let (bridge, runner) = make_bridge(FakeRunner::new(|_| ok("1\n")));
        assert!(bridge.boot_completed("emulator-5554").expect("getprop"));
        assert_eq!(runner.count("getprop sys.boot_completed"), 1);
    }
}
