//! The update coordinator.
//!
//! One instance owns the collaborators every package updater needs (HTTP
//! client, endpoints, manifest caches, network monitor, storage, patch
//! tool). `check_all` computes an ordered plan; `apply_all` drives it.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::auth::account::Auth;
use crate::build::Platform;
use crate::endpoints::Endpoints;
use crate::manifest::ManifestCaches;
use crate::net::NetMonitor;
use crate::state::{ChannelState, StateStore};
use crate::storage::Storage;

pub mod game;
pub mod jre;
pub mod launcher;
pub mod patcher;
pub mod types;

pub use game::{GameUpdate, Patch, PatchSet};
pub use jre::JreUpdate;
pub use launcher::LauncherUpdate;
pub use patcher::PatchTool;
pub use types::{CancelToken, StatusCallback, UpdateStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Launcher,
    Jre,
    Game,
}

/// A pending update for one package.
#[derive(Debug)]
pub enum Update {
    Launcher(LauncherUpdate),
    Jre(JreUpdate),
    Game(GameUpdate),
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self {
            Update::Launcher(_) => UpdateKind::Launcher,
            Update::Jre(_) => UpdateKind::Jre,
            Update::Game(_) => UpdateKind::Game,
        }
    }

    pub fn current_version(&self) -> Option<&str> {
        match self {
            Update::Launcher(u) => Some(&u.current_version),
            Update::Jre(u) => u.current.as_ref().map(|d| d.version.as_str()),
            Update::Game(u) => u.current.as_ref().map(|d| d.version.as_str()),
        }
    }

    pub fn target_version(&self) -> &str {
        match self {
            Update::Launcher(u) => &u.version,
            Update::Jre(u) => &u.version,
            Update::Game(u) => &u.version,
        }
    }

    async fn apply(
        &self,
        token: &CancelToken,
        updater: &Updater,
        state: &mut ChannelState,
        reporter: &StatusCallback,
    ) -> Result<()> {
        match self {
            Update::Launcher(u) => u.apply(token, updater, reporter).await,
            Update::Jre(u) => u.apply(token, updater, state, reporter).await,
            Update::Game(u) => u.apply(token, updater, state, reporter).await,
        }
    }
}

pub struct Updater {
    pub client: reqwest::Client,
    pub endpoints: Endpoints,
    pub storage: Storage,
    pub platform: Platform,
    pub net: Arc<NetMonitor>,
    pub manifests: ManifestCaches,
    pub patch_tool: PatchTool,
}

impl Updater {
    pub fn new(
        client: reqwest::Client,
        endpoints: Endpoints,
        storage: Storage,
        net: Arc<NetMonitor>,
    ) -> Self {
        let patch_tool = PatchTool::bundled(&storage);
        Self {
            client,
            endpoints,
            storage,
            platform: Platform::current(),
            net,
            manifests: ManifestCaches::default(),
            patch_tool,
        }
    }

    /// Compute the ordered update plan for a channel.
    ///
    /// A launcher update preempts everything: applying it replaces the
    /// process, so any further work in the same plan would be lost.
    /// Cancellation between package checks is a clean stop.
    pub async fn check_all(
        &self,
        token: &CancelToken,
        state: &ChannelState,
        auth: &Auth,
        channel: &str,
    ) -> Result<Vec<Update>> {
        let mut updates = Vec::new();

        if let Some(update) = LauncherUpdate::check(self).await? {
            updates.push(Update::Launcher(update));
            return Ok(updates);
        }

        token.bail_if_cancelled()?;
        if let Some(update) = JreUpdate::check(self, state, channel).await? {
            updates.push(Update::Jre(update));
        }

        token.bail_if_cancelled()?;
        if let Some(update) = GameUpdate::check(self, state, auth, channel).await? {
            updates.push(Update::Game(update));
        }

        Ok(updates)
    }

    /// Apply updates strictly in order, scaling update `i` of `n` into the
    /// progress slot `[i/n, (i+1)/n]`. The channel state is persisted after
    /// every successful package application. The first error aborts the
    /// plan and is surfaced verbatim.
    pub async fn apply_all(
        &self,
        token: &CancelToken,
        store: &StateStore,
        state: &mut ChannelState,
        updates: &[Update],
        reporter: &StatusCallback,
    ) -> Result<()> {
        let total = updates.len();

        for (i, update) in updates.iter().enumerate() {
            token.bail_if_cancelled()?;

            let offset = i as f64 / total as f64;
            let weight = 1.0 / total as f64;
            let sub = types::scaled(reporter.clone(), offset, weight);

            update.apply(token, self, state, &sub).await?;

            state.is_new = false;
            state.platform = Some(self.platform.clone());
            state.refresh_offline_ready();
            store
                .save(state)
                .with_context(|| format!("failed to persist state for channel {}", state.channel))?;
        }

        Ok(())
    }
}
