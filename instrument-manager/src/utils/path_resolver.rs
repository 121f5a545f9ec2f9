use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const LOG_FOLDER_NAME: &str = "logs";

/// Folder the binary runs from, or the current directory.
pub fn resolve_deployment_folder() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return dir.to_path_buf();
        }
    }

    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Resolve (and create) the log folder.
///
/// Order: the configured directory, then `<data_local_dir>/instrument-manager/logs`, then `logs/` next to
/// the binary.
pub fn resolve_log_folder(configured: Option<&Path>) -> Result<PathBuf> {
    let log_dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_local_dir()
            .map(|d| d.join("instrument-manager").join(LOG_FOLDER_NAME))
            .unwrap_or_else(|| resolve_deployment_folder().join(LOG_FOLDER_NAME)),
    };

    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log folder: {:?}", log_dir))?;
    Ok(log_dir)
}
