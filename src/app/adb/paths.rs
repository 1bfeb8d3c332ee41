/// Remote paths handed to `screencap`, `pull` and `rm` must be absolute and
/// stay below the root they name.
pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("remote path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err(format!("remote path must be absolute: {trimmed}"));
    }
    if trimmed.contains('\0') {
        return Err("remote path contains a NUL byte".to_string());
    }
    if trimmed == "/" {
        return Err("remote path must name a file below /".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(format!("remote path must not climb with '..': {trimmed}"));
    }
    Ok(())
}

pub fn device_file_name(device_path: &str) -> Option<&str> {
    device_path
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

/// Keeps `[A-Za-z0-9._-]`, replacing everything else with `_`.
pub fn sanitize_filename_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
