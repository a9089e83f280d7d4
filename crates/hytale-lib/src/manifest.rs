//! Per-component version manifests with process-wide memoization.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::build::Platform;
use crate::endpoints::Endpoints;
use crate::net::NetMonitor;

/// Download descriptor for one platform/arch pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub url: String,
    pub checksum: String,
    pub size: u64,
}

/// Version manifest for a component on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub build: u64,
    /// platform -> arch -> release.
    #[serde(default, rename = "download_url")]
    pub downloads: HashMap<String, HashMap<String, Release>>,
}

impl Manifest {
    pub fn release(&self, platform: &Platform) -> Option<&Release> {
        self.downloads.get(&platform.os)?.get(&platform.arch)
    }
}

/// A manifest resolved for the host platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedManifest {
    pub version: String,
    pub build: u64,
    pub url: String,
    pub hash: String,
    pub size: u64,
}

/// Fetch and decode a component manifest. Checks the network mode first and
/// fails fast with the offline sentinel.
pub async fn fetch_manifest(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    net: &NetMonitor,
    channel: &str,
    component: &str,
) -> Result<Manifest> {
    net.offline_error()?;

    let url = endpoints.launcher_version(channel, component);
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("failed to fetch manifest for {}/{}", channel, component))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error {} fetching manifest {}", response.status(), url);
    }

    let manifest = response
        .json::<Manifest>()
        .await
        .with_context(|| format!("failed to decode manifest for {}/{}", channel, component))?;
    Ok(manifest)
}

/// Memoizer for one component's manifest.
///
/// The slot lock is held across the fetch, so concurrent callers see at
/// most one in-flight request; a failed fetch leaves the slot empty.
pub struct Getter {
    component: &'static str,
    cache: Mutex<Option<CachedManifest>>,
}

impl Getter {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            cache: Mutex::new(None),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Return the cached manifest, fetching through `fetch` on a miss.
    pub async fn get_with<F, Fut>(&self, fetch: F) -> Result<CachedManifest>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedManifest>>,
    {
        let mut slot = self.cache.lock().await;
        if let Some(cached) = slot.as_ref() {
            return Ok(cached.clone());
        }

        let fetched = fetch().await?;
        log::debug!(
            "cached {} manifest: version={} build={}",
            self.component,
            fetched.version,
            fetched.build
        );
        *slot = Some(fetched.clone());
        Ok(fetched)
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

/// The three component memoizers the coordinator consults.
pub struct ManifestCaches {
    pub launcher: Getter,
    pub jre: Getter,
    pub game: Getter,
}

impl Default for ManifestCaches {
    fn default() -> Self {
        Self {
            launcher: Getter::new("launcher"),
            jre: Getter::new("jre"),
            game: Getter::new("game"),
        }
    }
}

impl ManifestCaches {
    /// Drop all cached manifests, forcing fresh fetches on the next check.
    pub async fn invalidate_all(&self) {
        log::debug!("invalidating all version manifests");
        self.launcher.invalidate().await;
        self.jre.invalidate().await;
        self.game.invalidate().await;
    }
}

/// Resolve a manifest against the host platform into the flat form the
/// updaters consume.
pub fn resolve(manifest: &Manifest, platform: &Platform, component: &str) -> Result<CachedManifest> {
    let release = manifest.release(platform).with_context(|| {
        format!(
            "no {} release available for {}/{}",
            component, platform.os, platform.arch
        )
    })?;
    Ok(CachedManifest {
        version: manifest.version.clone(),
        build: manifest.build,
        url: release.url.clone(),
        hash: release.checksum.clone(),
        size: release.size,
    })
}
