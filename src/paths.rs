//! Application paths for config, action store and logs.
//!
//! ## Mode Detection
//!
//! - **Dev mode** (debug builds only): `config.yaml` in the working directory
//!   wins, with state and logs next to it.
//! - **Portable mode**: a `.portable` marker next to the executable keeps every
//!   file in that directory.
//! - **Installed mode** (default): files live in the platform data directory
//!   (`%APPDATA%\Deck Actions`, `~/.local/share/Deck Actions`, ...).

use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory name used in installed mode
const APP_NAME: &str = "Deck Actions";

#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    /// Configuration file
    pub config: PathBuf,
    /// State directory (action store database)
    pub state_dir: PathBuf,
    /// Rolling log files
    pub logs_dir: PathBuf,
    pub is_portable: bool,
}

impl AppPaths {
    /// Detect the paths for this run.
    ///
    /// Called before logging is initialized, so diagnostics go to stderr.
    pub fn detect() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join("config.yaml").exists() {
                eprintln!("[paths] dev mode, using {}", cwd.display());
                return Self::rooted_at(&cwd, true);
            }
        }

        if exe_dir.join(".portable").exists() {
            return Self::rooted_at(&exe_dir, true);
        }

        let base = dirs::data_dir()
            .unwrap_or_else(|| {
                eprintln!("[paths] WARNING: no platform data directory, using the executable directory");
                exe_dir.clone()
            })
            .join(APP_NAME);
        Self {
            config: base.join("config.yaml"),
            state_dir: base.join("state"),
            logs_dir: base.join("logs"),
            is_portable: false,
        }
    }

    /// Layout with every file under `dir`
    pub fn rooted_at(dir: &Path, is_portable: bool) -> Self {
        Self {
            config: dir.join("config.yaml"),
            state_dir: dir.join(".state"),
            logs_dir: dir.join("logs"),
            is_portable,
        }
    }

    /// Create the state and log directories (and the config directory in
    /// installed mode)
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        let mut wanted: Vec<&Path> = vec![self.state_dir.as_path(), self.logs_dir.as_path()];
        if !self.is_portable {
            if let Some(parent) = self.config.parent() {
                wanted.push(parent);
            }
        }

        for dir in wanted {
            if !dir.exists() {
                debug!("Creating directory: {}", dir.display());
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Action store database directory
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("actions.sled")
    }
}
