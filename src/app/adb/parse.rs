use crate::app::models::DeviceSummary;

pub const ONLINE_STATE: &str = "device";

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let mut model = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
                model,
                transport_id,
            })
        })
        .collect()
}

/// Listed AND online, from the same snapshot.
pub fn is_device_online(devices: &[DeviceSummary], serial: &str) -> bool {
    devices
        .iter()
        .any(|device| device.serial == serial && device.state == ONLINE_STATE)
}

/// `adb install` prints `Success` on the last line; failures print `Failure [REASON]`.
pub fn install_succeeded(output: &str) -> bool {
    let has_success = output.lines().any(|line| line.trim() == "Success");
    has_success && !output.contains("Failure")
}

/// `am start` echoes `Starting: Intent { ... }` and reports problems on `Error` lines,
/// sometimes with a zero exit code.
pub fn activity_started(output: &str) -> bool {
    let mut started = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Error") || trimmed.starts_with("Exception") {
            return false;
        }
        if trimmed.starts_with("Starting:") || trimmed.starts_with("Status: ok") {
            started = true;
        }
    }
    started
}

/// Matches the process-name column of `ps -A` exactly; `pkg:service` processes don't count.
pub fn process_listed(ps_output: &str, package: &str) -> bool {
    find_process_pid(ps_output, package).is_some()
}

pub fn find_process_pid(ps_output: &str, package: &str) -> Option<u32> {
    let package = package.trim();
    if package.is_empty() {
        return None;
    }
    ps_output
        .lines()
        .filter(|line| !line.trim_start().starts_with("USER"))
        .find_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.last() != Some(&package) {
                return None;
            }
            tokens.get(1).and_then(|value| value.parse::<u32>().ok())
        })
}

pub fn parse_boot_completed(output: &str) -> bool {
    output.trim() == "1"
}
