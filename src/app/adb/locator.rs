use std::path::{Path, PathBuf};

use crate::app::config::SdkSettings;
use crate::app::error::AppError;

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

/// SDK root from config, else `ANDROID_SDK_ROOT`, else `ANDROID_HOME`.
pub fn resolve_sdk_root(settings: &SdkSettings) -> Option<PathBuf> {
    let configured = normalize_command_path(&settings.sdk_path);
    if !configured.is_empty() {
        return Some(PathBuf::from(expand_home(&configured)));
    }
    ["ANDROID_SDK_ROOT", "ANDROID_HOME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn resolve_tool(override_path: &str, sdk_root: Option<&Path>, sdk_subdir: &str, name: &str) -> String {
    let normalized = normalize_command_path(override_path);
    if !normalized.is_empty() {
        return expand_home(&normalized);
    }
    match sdk_root {
        Some(root) => root
            .join(sdk_subdir)
            .join(executable_name(name))
            .to_string_lossy()
            .to_string(),
        None => name.to_string(),
    }
}

pub fn resolve_adb_program(settings: &SdkSettings) -> String {
    let root = resolve_sdk_root(settings);
    resolve_tool(&settings.adb_path, root.as_deref(), "platform-tools", "adb")
}

pub fn resolve_emulator_program(settings: &SdkSettings) -> String {
    let root = resolve_sdk_root(settings);
    resolve_tool(&settings.emulator_path, root.as_deref(), "emulator", "emulator")
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Fails with `ERR_TOOL_MISSING` when `program` cannot be executed.
pub fn validate_program(program: &str, label: &str, trace_id: &str) -> Result<(), AppError> {
    if program.trim().is_empty() {
        return Err(AppError::tool_missing(format!("{label} command is empty"), trace_id));
    }
    let path = Path::new(program);
    let is_bare_name = path.components().count() == 1 && !program.contains(['/', '\\']);
    if is_bare_name {
        if find_on_path(program).is_some() || find_on_path(&executable_name(program)).is_some() {
            return Ok(());
        }
        return Err(AppError::tool_missing(
            format!("{label} executable `{program}` not found on PATH"),
            trace_id,
        ));
    }
    if path.is_dir() {
        return Err(AppError::tool_missing(
            format!("{label} path must point to an executable file: {program}"),
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::tool_missing(
            format!("{label} executable not found at {program}"),
            trace_id,
        ));
    }
    Ok(())
}
