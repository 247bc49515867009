use std::path::PathBuf;
use std::sync::OnceLock;

static NEXTAI_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the NextAI home directory (`~/.nextai/`).
/// Supports `$NEXTAI_DATA_DIR` env override. Cached via `OnceLock`.
pub fn nextai_home() -> &'static PathBuf {
    NEXTAI_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("NEXTAI_DATA_DIR") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nextai")
    })
}

/// `<data_dir>/state/` — aggregated JSON files, one per state-store aggregate.
pub fn state_dir() -> PathBuf {
    nextai_home().join("state")
}

/// `<data_dir>/logs/`
pub fn logs_dir() -> PathBuf {
    nextai_home().join("logs")
}

/// `<data_dir>/workspace/` — the file whitelist roots live beneath this.
pub fn workspace_dir() -> PathBuf {
    match std::env::var("NEXTAI_WEB_DIR") {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => nextai_home().join("workspace"),
    }
}

/// `<data_dir>/plans/` — plan-mode soft-reset seed files, for operator inspection.
pub fn plans_dir() -> PathBuf {
    nextai_home().join("plans")
}
