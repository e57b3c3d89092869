use std::path::{Path, PathBuf};

use crate::errors::{EngineError, Result};

/// Staging directory for a download's chunk parts: a hidden sibling of the
/// final path, `<save_dir>/.<save_name>.dpnh/`.
pub fn staging_dir(save_path: &Path) -> Result<PathBuf> {
    let parent = save_path
        .parent()
        .ok_or_else(|| EngineError::Validation("save path has no parent directory".to_string()))?;
    let name = file_name(save_path)?;
    Ok(parent.join(format!(".{name}.dpnh")))
}

/// Simple-mode part file: `<save_dir>/<save_name>.part`.
pub fn simple_part_path(save_path: &Path) -> Result<PathBuf> {
    let parent = save_path
        .parent()
        .ok_or_else(|| EngineError::Validation("save path has no parent directory".to_string()))?;
    let name = file_name(save_path)?;
    Ok(parent.join(format!("{name}.part")))
}

pub fn chunk_part_path(staging: &Path, chunk_index: u32) -> PathBuf {
    staging.join(format!("chunk-{chunk_index:04}.part"))
}

pub fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|value| value.to_string_lossy().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EngineError::Validation("save path has no file name".to_string()))
}

#[cfg(unix)]
const RESERVED_DIRS: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/sbin", "/sys", "/usr",
];

#[cfg(windows)]
const RESERVED_DIRS: &[&str] = &[
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
];

/// Save-path policy: absolute, carries a file name, and neither equal to nor
/// under a reserved OS directory.
pub fn validate_save_path(raw: &str) -> Result<PathBuf> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(EngineError::Validation(format!(
            "save path must be absolute: {raw}"
        )));
    }
    file_name(&path)?;
    if path.parent().map(|p| p.as_os_str().is_empty()).unwrap_or(true) {
        return Err(EngineError::Validation(format!(
            "save path must not be a filesystem root: {raw}"
        )));
    }
    for reserved in RESERVED_DIRS {
        let reserved_path = Path::new(reserved);
        if path == reserved_path || path.starts_with(reserved_path) {
            return Err(EngineError::Validation(format!(
                "save path under reserved directory {reserved}: {raw}"
            )));
        }
    }
    Ok(path)
}

pub fn remove_file_if_exists(path: &Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            tracing::warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}

pub fn remove_dir_if_exists(path: &Path) {
    if path.exists() {
        if let Err(err) = std::fs::remove_dir_all(path) {
            tracing::warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let value = bytes as f64;
    if value >= TB {
        format!("{:.2} TB", value / TB)
    } else if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.0} MB", value / MB)
    } else if value >= KB {
        format!("{:.0} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}
