// Path Validation
// Keeps device directories and served segment files inside the segments root

use std::path::{Component, Path, PathBuf};

/// Extensions a segment stream may serve
pub const SEGMENT_EXTENSIONS: &[&str] = &["ts", "m3u8"];

/// Check that a device id can be used as a single directory name.
/// Only ASCII letters, digits, `-`, `_` and `.` are accepted; `.` and `..` are not.
pub fn validate_device_id(device_id: &str) -> Result<(), String> {
    if device_id.is_empty() {
        return Err("Device id must not be empty".to_string());
    }
    if device_id == "." || device_id == ".." {
        return Err(format!("Device id '{device_id}' is not a valid directory name"));
    }
    if let Some(bad) = device_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("Device id '{device_id}' contains invalid character '{bad}'"));
    }
    Ok(())
}

/// Validate that an existing path is within an allowed directory.
///
/// # Returns
/// * `Ok(PathBuf)` - The canonicalized path if valid
/// * `Err(String)` - Error message if validation fails
pub fn validate_path_within(path: &Path, allowed_dir: &Path) -> Result<PathBuf, String> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Err("Path traversal detected: '..' not allowed".to_string());
    }

    let canonical = path
        .canonicalize()
        .map_err(|e| format!("Invalid path: {e}"))?;
    let allowed_canonical = allowed_dir
        .canonicalize()
        .map_err(|e| format!("Invalid allowed directory: {e}"))?;

    if !canonical.starts_with(&allowed_canonical) {
        return Err("Path traversal detected: path outside allowed directory".to_string());
    }

    Ok(canonical)
}

/// Validate file extension is allowed (extensions without dot, e.g. "ts")
pub fn validate_extension(path: &Path, allowed_extensions: &[&str]) -> Result<(), String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| "File must have an extension".to_string())?;

    if !allowed_extensions.contains(&extension) {
        return Err(format!(
            "Invalid file extension '{}'. Allowed: {}",
            extension,
            allowed_extensions.join(", ")
        ));
    }

    Ok(())
}

/// Resolve a requested segment or playlist name inside `device_dir`.
///
/// The name must be a bare file name with an allowed extension, and the file
/// must exist (symlinks pointing elsewhere are rejected).
pub fn resolve_segment_file(device_dir: &Path, file_name: &str) -> Result<PathBuf, String> {
    let requested = Path::new(file_name);
    let mut components = requested.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => {
            return Err(format!(
                "Path traversal detected: '{file_name}' is not a plain file name"
            ))
        }
    }

    validate_extension(requested, SEGMENT_EXTENSIONS)?;
    validate_path_within(&device_dir.join(requested), device_dir)
}
