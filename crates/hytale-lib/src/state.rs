//! Persistent per-channel state: which package versions are installed where.
//!
//! One JSON file per channel under `<storage>/state/`. A state file is
//! either absent or complete; saves go through a temp file and a rename.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::build::Platform;
use crate::storage::Storage;

/// Package ids tracked in channel state.
pub const PKG_LAUNCHER: &str = "launcher";
pub const PKG_JRE: &str = "jre";
pub const PKG_GAME: &str = "game";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The channel has never been saved. Distinct from I/O failure so
    /// callers can create a fresh state instead of masking disk errors.
    #[error("channel state not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed channel state: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// An installed dependency version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Dep {
    pub version: String,
    pub build: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub build_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sig_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sig_file: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Dep {
    /// Full path of the rolling signature file, if one is recorded.
    pub fn sig_path(&self) -> Option<PathBuf> {
        if self.sig_dir.is_empty() {
            return None;
        }
        Some(Path::new(&self.sig_dir).join(&self.sig_file))
    }
}

type DepMap = BTreeMap<String, BTreeMap<String, Dep>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_new: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: DepMap,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub offline_ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_dir: String,
}

impl ChannelState {
    pub fn new(channel: &str, storage: &Storage) -> Self {
        Self {
            channel: channel.to_string(),
            is_new: true,
            platform: Some(Platform::current()),
            dependencies: BTreeMap::new(),
            offline_ready: false,
            data_dir: storage.root().to_string_lossy().into_owned(),
        }
    }

    /// Replace the whole version map for a package, or drop the package
    /// entirely when `dep` is `None`. `cause` is logged for forensics.
    pub fn set_dependency(&mut self, identifier: &str, cause: &str, dep: Option<Dep>) {
        log::debug!(
            "setting dependency: identifier={} cause={} version={:?}",
            identifier,
            cause,
            dep.as_ref().map(|d| d.version.as_str())
        );

        match dep {
            None => {
                self.dependencies.remove(identifier);
            }
            Some(dep) => {
                let mut versions = BTreeMap::new();
                versions.insert(dep.version.clone(), dep);
                self.dependencies.insert(identifier.to_string(), versions);
            }
        }
    }

    /// Insert a version for a package, preserving existing entries. The
    /// multi-entry form only exists transiently while a replacement is
    /// being validated.
    pub fn add_dependency(&mut self, identifier: &str, dep: Dep) {
        log::debug!(
            "adding dependency: identifier={} version={}",
            identifier,
            dep.version
        );
        self.dependencies
            .entry(identifier.to_string())
            .or_default()
            .insert(dep.version.clone(), dep);
    }

    /// Remove one version; drops the package entry when it becomes empty.
    pub fn remove_dependency(&mut self, identifier: &str, version: &str) {
        log::debug!(
            "removing dependency: identifier={} version={}",
            identifier,
            version
        );
        if let Some(versions) = self.dependencies.get_mut(identifier) {
            versions.remove(version);
            if versions.is_empty() {
                self.dependencies.remove(identifier);
            }
        }
    }

    pub fn get_deps(&self, identifier: &str) -> Option<&BTreeMap<String, Dep>> {
        self.dependencies.get(identifier)
    }

    /// First recorded version for a package; convenient while the inner
    /// map is the expected singleton.
    pub fn first_dep(&self, identifier: &str) -> Option<&Dep> {
        self.dependencies
            .get(identifier)?
            .values()
            .next()
    }

    /// Whether the recorded install platform matches the host. A mismatch
    /// (or a state written before platforms were recorded) forces a fresh
    /// install.
    pub fn platform_matches(&self) -> bool {
        match &self.platform {
            Some(p) => *p == Platform::current(),
            None => false,
        }
    }

    /// Recompute `offline_ready` from the filesystem: the game can launch
    /// without network iff the JRE and game installs exist and the game's
    /// rolling signature is present.
    pub fn refresh_offline_ready(&mut self) -> bool {
        let jre_ok = self
            .first_dep(PKG_JRE)
            .map(|d| !d.path.is_empty() && Path::new(&d.path).exists())
            .unwrap_or(false);
        let game_ok = self
            .first_dep(PKG_GAME)
            .map(|d| {
                !d.path.is_empty()
                    && Path::new(&d.path).exists()
                    && d.sig_path().map(|p| p.exists()).unwrap_or(false)
            })
            .unwrap_or(false);

        self.offline_ready = jre_ok && game_ok;
        self.offline_ready
    }
}

/// Loads and persists [`ChannelState`] files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(storage: &Storage) -> Self {
        Self {
            dir: storage.state_dir(),
        }
    }

    fn path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}.json", channel))
    }

    pub fn load(&self, channel: &str) -> Result<ChannelState, StateError> {
        let path = self.path_for(channel);
        let contents = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let state: ChannelState = serde_json::from_slice(&contents)?;
        Ok(state)
    }

    /// Atomic save: write a sibling temp file, then rename over the target.
    /// A crash leaves at most one of the old or new file intact.
    pub fn save(&self, state: &ChannelState) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&state.channel);
        let tmp = self.dir.join(format!("{}.json.tmp", state.channel));

        let json = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;

        log::debug!("saved channel state: channel={}", state.channel);
        Ok(())
    }

    pub fn list_channels(&self) -> Result<Vec<String>, StateError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut channels = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(channel) = name.strip_suffix(".json") {
                channels.push(channel.to_string());
            }
        }
        channels.sort();
        Ok(channels)
    }
}
