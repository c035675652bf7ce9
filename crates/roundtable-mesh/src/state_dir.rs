use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_STATE_DIR: &str = ".local/state/roundtable";

/// Return the roundtable state directory path.
///
/// Priority: `$ROUNDTABLE_STATE_DIR` env var, then `~/.local/state/roundtable`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("ROUNDTABLE_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// Create `path` if needed and restrict it to the owner (`0700`). The chat
/// history stored there may contain anything users pasted into prompts.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create state dir {}", path.display()))?;
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to set state dir permissions {}", path.display()))?;
    Ok(())
}
