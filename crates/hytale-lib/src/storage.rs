//! Per-user storage layout.
//!
//! Everything the launcher writes lives under one root:
//! `state/<channel>.json`, `pkg/<package>/<channel>/latest/`, `cache/`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Resolve the OS per-user data directory ($XDG_DATA_HOME on Linux,
    /// the platform equivalent elsewhere) and append the app folder.
    pub fn resolve() -> Result<Self> {
        let base = dirs::data_dir().context("unable to determine user data directory")?;
        let root = base.join("hytale");
        log::info!("selected storage directory: {:?}", root);
        Ok(Self { root })
    }

    /// Root an instance at an explicit path. Used by tests and the
    /// self-update helper.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_storage(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Channel state files.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Transient download scratch; flushed on app startup.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Install root for a package on a channel.
    pub fn package_dir(&self, package: &str, channel: &str) -> PathBuf {
        self.root.join("pkg").join(package).join(channel).join("latest")
    }

    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("unable to create storage directory {:?}", self.root))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_dir_is_channel_scoped() {
        let s = Storage::at("/data/hytale");
        assert_eq!(
            s.package_dir("game", "release"),
            PathBuf::from("/data/hytale/pkg/game/release/latest")
        );
        assert_eq!(s.cache_dir(), PathBuf::from("/data/hytale/cache"));
    }
}
