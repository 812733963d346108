use std::path::{Path, PathBuf};

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn resolve_root_dir() -> PathBuf {
    if let Some(path) = env_path("MULEBRIDGE_ROOT_DIR") {
        if let Some(dir) = ensure_dir(&path) {
            return dir;
        }
        tracing::warn!(
            "MULEBRIDGE_ROOT_DIR '{}' is not usable, falling back to current directory",
            path.display()
        );
    }
    PathBuf::from(".")
}

pub fn resolve_data_dir(root: &Path) -> PathBuf {
    let data = root.join("data");
    ensure_dir(&data).unwrap_or_else(|| root.to_path_buf())
}

pub fn resolve_history_db(root: &Path) -> PathBuf {
    env_path("MULEBRIDGE_HISTORY_DB").unwrap_or_else(|| resolve_data_dir(root).join("history.db"))
}

pub fn resolve_log_dir(root: &Path) -> PathBuf {
    env_path("MULEBRIDGE_LOG_DIR").unwrap_or_else(|| root.join("logs"))
}
