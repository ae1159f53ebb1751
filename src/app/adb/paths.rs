use std::path::{Path, PathBuf};

pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device path must be absolute".to_string());
    }
    if trimmed.contains('\0') || trimmed.chars().any(|c| c.is_whitespace()) {
        return Err("device path contains invalid characters".to_string());
    }
    if trimmed == "/" {
        return Err("device path must not be root".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err("device path must not contain '..' segments".to_string());
    }
    Ok(())
}

/// Last segment of a device path, which is also the local file name.
pub fn remote_basename(device_path: &str) -> Option<&str> {
    let name = device_path.trim().trim_end_matches('/').rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

/// Serials become directory names in the output tree; reject the ones that would escape it.
pub fn validate_serial_component(serial: &str) -> Result<(), String> {
    let trimmed = serial.trim();
    if trimmed.is_empty() {
        return Err("serial is required".to_string());
    }
    if trimmed != serial {
        return Err("serial must not have surrounding whitespace".to_string());
    }
    if serial == "." || serial == ".." || serial.contains(['/', '\\', '\0']) {
        return Err(format!("serial '{serial}' cannot be used as a directory name"));
    }
    Ok(())
}

pub fn device_output_dir(output_dir: &Path, serial: &str) -> PathBuf {
    output_dir.join(serial)
}

/// Single-quotes an argument for the device's `sh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', "'\\''"))
}
