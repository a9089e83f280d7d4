//! Bundled Java runtime updates.
//!
//! The JRE is replaced wholesale: uninstall the old tree first, then
//! download, extract, locate the java binary, and smoke-test it.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::build;
use crate::download::{self, Reporter};
use crate::manifest;
use crate::state::{ChannelState, Dep, PKG_JRE};
use crate::update::types::{
    CancelToken, StatusCallback, UpdateStatus, STATE_COMPLETE, STATE_DOWNLOADING,
    STATE_INSTALLING,
};
use crate::update::Updater;
use crate::utils;

#[derive(Debug, Clone)]
pub struct JreUpdate {
    pub channel: String,
    pub current: Option<Dep>,
    pub version: String,
    pub build: u64,
    pub url: String,
    pub hash: String,
    pub size: u64,
}

impl JreUpdate {
    /// Compare the installed JRE build against the manifest.
    pub async fn check(
        updater: &Updater,
        state: &ChannelState,
        channel: &str,
    ) -> Result<Option<JreUpdate>> {
        let cached = updater
            .manifests
            .jre
            .get_with(|| async {
                let m = manifest::fetch_manifest(
                    &updater.client,
                    &updater.endpoints,
                    &updater.net,
                    channel,
                    "jre",
                )
                .await?;
                manifest::resolve(&m, &updater.platform, "jre")
            })
            .await
            .context("failed to get Java manifest")?;

        let current = if state.platform_matches() {
            state.first_dep(PKG_JRE).cloned()
        } else {
            None
        };

        if let Some(dep) = &current {
            if dep.build >= cached.build {
                log::debug!(
                    "Java is up to date: current={} latest={}",
                    dep.build,
                    cached.build
                );
                return Ok(None);
            }
        }

        log::info!(
            "Java update available: current={:?} target={} version={}",
            current.as_ref().map(|d| d.build),
            cached.build,
            cached.version
        );

        Ok(Some(JreUpdate {
            channel: channel.to_string(),
            current,
            version: cached.version,
            build: cached.build,
            url: cached.url,
            hash: cached.hash,
            size: cached.size,
        }))
    }

    pub async fn apply(
        &self,
        token: &CancelToken,
        updater: &Updater,
        state: &mut ChannelState,
        reporter: &StatusCallback,
    ) -> Result<()> {
        log::info!("applying Java update: version={} build={}", self.version, self.build);

        let jre_dir = updater.storage.package_dir(PKG_JRE, &self.channel);

        // Uninstall before staging the replacement; a crash here leaves a
        // transiently empty install that the next check repairs.
        self.uninstall(state, &jre_dir).await;

        tokio::fs::create_dir_all(&jre_dir)
            .await
            .with_context(|| format!("unable to create Java directory {:?}", jre_dir))?;

        let download_reporter = Reporter::new(
            STATE_DOWNLOADING,
            Some(json!({ "component": "jre", "version": self.version })),
            0.8,
            0.0,
            Some(self.size).filter(|s| *s > 0),
            reporter.clone(),
        );
        let archive = download::download_to_temp(
            token,
            &updater.client,
            &updater.storage.cache_dir(),
            &self.url,
            Some(&self.hash),
            &download_reporter,
        )
        .await
        .context("failed to download Java")?;

        reporter(UpdateStatus::new(STATE_INSTALLING, 0.8));

        let result = self.install(token, &archive, &jre_dir).await;
        let _ = tokio::fs::remove_file(&archive).await;

        let java_bin = match result {
            Ok(bin) => bin,
            Err(err) => {
                // Leave no half-extracted runtime behind.
                let _ = tokio::fs::remove_dir_all(&jre_dir).await;
                return Err(err);
            }
        };
        log::debug!("installed java binary: {:?}", java_bin);

        state.set_dependency(
            PKG_JRE,
            "update",
            Some(Dep {
                version: self.version.clone(),
                build: self.build,
                hash: self.hash.clone(),
                path: jre_dir.to_string_lossy().into_owned(),
                ..Default::default()
            }),
        );

        reporter(UpdateStatus::new(STATE_COMPLETE, 1.0));
        log::info!("Java update complete: version={}", self.version);
        Ok(())
    }

    async fn uninstall(&self, state: &mut ChannelState, jre_dir: &Path) {
        if self.current.is_none() {
            return;
        }
        if let Err(err) = tokio::fs::remove_dir_all(jre_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "failed to remove old java installation {:?}: {}",
                    jre_dir,
                    err
                );
            }
        }
        state.set_dependency(PKG_JRE, "uninstall", None);
    }

    async fn install(
        &self,
        token: &CancelToken,
        archive: &Path,
        jre_dir: &Path,
    ) -> Result<PathBuf> {
        utils::extract_archive(archive, jre_dir).context("failed to extract Java")?;

        let java_bin = utils::find_executable(jre_dir, &["bin/java", "bin/java.exe"])
            .context("no java binary found in extracted runtime")?;
        utils::make_executable(&java_bin)?;

        self.smoke_test(token, &java_bin).await?;
        Ok(java_bin)
    }

    /// Run `java --version` and require exit code 0. Dev builds can skip.
    async fn smoke_test(&self, token: &CancelToken, java_bin: &Path) -> Result<()> {
        if !build::test_run_binaries() {
            log::debug!("skipping binary test run: {:?}", java_bin);
            return Ok(());
        }

        log::debug!("validating Java binary: {:?}", java_bin);

        let mut child = Command::new(java_bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start java process")?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => anyhow::bail!("java validation cancelled"),
        };

        if !status.success() {
            anyhow::bail!(
                "java validation failed with exit code {}",
                status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }
}
