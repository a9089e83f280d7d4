//! URL builders for the launcher's backend services.

use crate::build::{self, Platform};

/// Base domain baked in at compile time; dev builds fall back to production.
pub const DEFAULT_DOMAIN: &str = match option_env!("HYTALE_LAUNCHER_DOMAIN") {
    Some(d) => d,
    None => "hytale.com",
};

/// Resolved service base URLs. Constructed once from the domain; tests
/// substitute explicit bases pointing at local fixtures.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub launcher_base: String,
    pub account_base: String,
    pub oauth_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::for_domain(DEFAULT_DOMAIN)
    }
}

impl Endpoints {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            launcher_base: format!("https://launcher.{}", domain),
            account_base: format!("https://account-data.{}", domain),
            oauth_base: format!("https://oauth.accounts.{}", domain),
        }
    }

    /// Version manifest for a component on a channel.
    pub fn launcher_version(&self, channel: &str, component: &str) -> String {
        format!("{}/version/{}/{}.json", self.launcher_base, channel, component)
    }

    /// Patch chain from `from_build` up to the newest build on a channel.
    pub fn game_patch_set(&self, platform: &Platform, channel: &str, from_build: u64) -> String {
        format!(
            "{}/patches/{}/{}/{}/{}",
            self.account_base, platform.os, platform.arch, channel, from_build
        )
    }

    /// Account launcher data: profiles, patchlines, EULA.
    pub fn launcher_data(&self) -> String {
        format!("{}/launcher-data", self.account_base)
    }

    pub fn feed(&self) -> String {
        format!(
            "{}/launcher-feed/{}/feed.json",
            self.launcher_base,
            build::RELEASE
        )
    }

    pub fn oauth_auth(&self) -> String {
        format!("{}/oauth2/auth", self.oauth_base)
    }

    pub fn oauth_token(&self) -> String {
        format!("{}/oauth2/token", self.oauth_base)
    }
}
