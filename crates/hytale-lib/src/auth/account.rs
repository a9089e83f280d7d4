//! Account data: profiles, patchlines, tokens.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::build::Platform;
use crate::endpoints::Endpoints;
use crate::net::NetMonitor;

/// OAuth tokens for a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => expiry <= Utc::now(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entitlements: Vec<String>,
}

impl Profile {
    /// Channels this profile is entitled to, from `patchline:<name>`
    /// entitlements.
    pub fn entitled_channels(&self) -> Vec<String> {
        self.entitlements
            .iter()
            .filter_map(|e| e.strip_prefix("patchline:"))
            .map(str::to_string)
            .collect()
    }
}

/// A game release channel as the account service sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patchline {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub newest_build: u64,
}

/// Wire shape of the launcher-data endpoint.
#[derive(Debug, Deserialize)]
struct LauncherData {
    #[serde(default)]
    profiles: Vec<Profile>,
    #[serde(default)]
    patchlines: HashMap<String, Patchline>,
    #[serde(default)]
    eula_accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub patchlines: HashMap<String, Patchline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eula_accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token: Token,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_channel: Option<String>,

    #[serde(skip)]
    pub last_refresh: Option<DateTime<Utc>>,
}

impl Account {
    /// Select a profile by UUID, or clear the selection with an empty uuid.
    pub fn set_current_profile(&mut self, uuid: &str) -> Result<()> {
        log::debug!("setting current profile: {}", uuid);
        if uuid.is_empty() {
            self.selected_profile = None;
            return Ok(());
        }
        if !self.profiles.iter().any(|p| p.uuid == uuid) {
            anyhow::bail!("no profile with UUID {} found", uuid);
        }
        self.selected_profile = Some(uuid.to_string());
        Ok(())
    }

    pub fn current_profile(&self) -> Option<&Profile> {
        let uuid = self.selected_profile.as_deref()?;
        self.profiles.iter().find(|p| p.uuid == uuid)
    }

    /// Pull fresh launcher data from the account service. A response with
    /// no profiles is ignored rather than wiping local data.
    pub async fn refresh(
        &mut self,
        client: &reqwest::Client,
        endpoints: &Endpoints,
        net: &NetMonitor,
        platform: &Platform,
        cause: &str,
    ) -> Result<()> {
        log::debug!("refreshing account data: cause={}", cause);
        net.offline_error()?;

        let response = client
            .get(endpoints.launcher_data())
            .query(&[("os", platform.os.as_str()), ("arch", platform.arch.as_str())])
            .bearer_auth(&self.token.access_token)
            .send()
            .await
            .context("error fetching account launcher data")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "HTTP error {} fetching account launcher data",
                response.status()
            );
        }

        let data: LauncherData = response
            .json()
            .await
            .context("error decoding account launcher data")?;

        if data.profiles.is_empty() {
            return Ok(());
        }

        self.profiles = data.profiles;
        self.patchlines = data.patchlines;
        self.eula_accepted_at = data.eula_accepted_at;
        self.last_refresh = Some(Utc::now());
        Ok(())
    }
}

/// Authentication handed to the update coordinator.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub token: String,
    pub account: Option<Account>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitled_channels_filters_patchline_entitlements() {
        let profile = Profile {
            name: "player".into(),
            uuid: "u-1".into(),
            entitlements: vec![
                "patchline:release".into(),
                "patchline:beta".into(),
                "cosmetic:hat".into(),
            ],
        };
        assert_eq!(profile.entitled_channels(), vec!["release", "beta"]);
    }

    #[test]
    fn profile_selection_validates_uuid() {
        let mut account = Account {
            profiles: vec![Profile {
                name: "player".into(),
                uuid: "u-1".into(),
                entitlements: vec![],
            }],
            ..Default::default()
        };

        assert!(account.set_current_profile("nope").is_err());
        account.set_current_profile("u-1").unwrap();
        assert_eq!(account.current_profile().unwrap().uuid, "u-1");

        account.set_current_profile("").unwrap();
        assert!(account.current_profile().is_none());
    }

    #[test]
    fn token_expiry() {
        let mut token = Token::default();
        assert!(!token.is_expired());
        token.expiry = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(token.is_expired());
    }
}
