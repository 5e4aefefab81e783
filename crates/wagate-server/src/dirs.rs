use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Directory holding `wagate.db` and `wagate.key`, created if missing.
///
/// An explicit directory wins over `WAGATE_DATA_DIR`, which wins over the
/// platform data dir (`~/.local/share/wagate/` on Linux).
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => match std::env::var_os("WAGATE_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("", "", "wagate")
                .context("no platform data directory for wagate")?
                .data_dir()
                .to_path_buf(),
        },
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}
