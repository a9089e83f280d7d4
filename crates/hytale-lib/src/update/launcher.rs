//! Launcher self-updates, apply side.
//!
//! Replacing the running binary is terminal: after the handoff process is
//! spawned the current process exits, which is why the coordinator returns
//! a launcher update alone and first.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::build;
use crate::crypto;
use crate::download::{self, Reporter};
use crate::manifest;
use crate::update::types::{
    CancelToken, StatusCallback, UpdateStatus, STATE_DOWNLOADING, STATE_INSTALLING,
};
use crate::update::Updater;
use crate::utils;

#[derive(Debug, Clone)]
pub struct LauncherUpdate {
    pub channel: String,
    pub current_version: String,
    pub current_build: u64,
    pub version: String,
    pub build: u64,
    pub url: String,
    pub hash: String,
    pub size: u64,
}

impl LauncherUpdate {
    /// Compare this binary's build number against the manifest for the
    /// release branch it was built from.
    pub async fn check(updater: &Updater) -> Result<Option<LauncherUpdate>> {
        let cached = updater
            .manifests
            .launcher
            .get_with(|| async {
                let m = manifest::fetch_manifest(
                    &updater.client,
                    &updater.endpoints,
                    &updater.net,
                    build::RELEASE,
                    "launcher",
                )
                .await?;
                manifest::resolve(&m, &updater.platform, "launcher")
            })
            .await
            .context("failed to get launcher manifest")?;

        let current_build = build::build_number();
        if current_build >= cached.build {
            log::debug!(
                "launcher is up to date: current={} latest={}",
                current_build,
                cached.build
            );
            return Ok(None);
        }

        log::info!(
            "launcher update available: current_version={} current_build={} target_version={} target_build={}",
            build::VERSION,
            current_build,
            cached.version,
            cached.build
        );

        Ok(Some(LauncherUpdate {
            channel: build::RELEASE.to_string(),
            current_version: build::VERSION.to_string(),
            current_build,
            version: cached.version,
            build: cached.build,
            url: cached.url,
            hash: cached.hash,
            size: cached.size,
        }))
    }

    /// Download, smoke-test, and hand off to the new binary. On success
    /// this exits the process and never returns.
    pub async fn apply(
        &self,
        token: &CancelToken,
        updater: &Updater,
        reporter: &StatusCallback,
    ) -> Result<()> {
        log::info!(
            "applying launcher update: from={} to={}",
            self.current_version,
            self.version
        );

        // First hop is always the OS temp dir; the handoff validator
        // requires both ends of the copy to live under it.
        let download_reporter = Reporter::new(
            STATE_DOWNLOADING,
            Some(json!({ "component": "launcher", "version": self.version })),
            0.8,
            0.0,
            Some(self.size).filter(|s| *s > 0),
            reporter.clone(),
        );
        let new_binary = download::download_to_temp(
            token,
            &updater.client,
            &std::env::temp_dir(),
            &self.url,
            Some(&self.hash),
            &download_reporter,
        )
        .await
        .context("failed to download launcher")?;

        reporter(UpdateStatus::new(STATE_INSTALLING, 0.8));

        if let Err(err) = self.validate_bin(token, &new_binary).await {
            let _ = std::fs::remove_file(&new_binary);
            return Err(err).context("launcher validation failed");
        }

        if let Err(err) = self.hand_off(&new_binary) {
            let _ = std::fs::remove_file(&new_binary);
            return Err(err).context("self-update failed");
        }

        // Unreachable: hand_off exits the process.
        Ok(())
    }

    /// Smoke-test the downloaded binary with `-test`.
    async fn validate_bin(&self, token: &CancelToken, bin: &Path) -> Result<()> {
        utils::make_executable(bin)?;

        if !build::test_run_binaries() {
            log::debug!("skipping binary test run: {:?}", bin);
            return Ok(());
        }

        let mut child = Command::new(bin)
            .arg("-test")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start downloaded launcher")?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = token.cancelled() => anyhow::bail!("launcher validation cancelled"),
        };

        if !output.status.success() {
            log::error!(
                "launcher test failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            anyhow::bail!("downloaded launcher binary is not functional");
        }
        Ok(())
    }

    /// Sign the handoff arguments and spawn the new binary as the update
    /// helper, then exit.
    fn hand_off(&self, new_binary: &Path) -> Result<()> {
        let key = crypto::load_self_update_key().context("failed to load self-update key")?;

        let current_exe = std::env::current_exe().context("unable to resolve current executable")?;
        let pid = std::process::id();

        // The signature covers the destination path so a tampered argv
        // cannot point the helper at an arbitrary file.
        let sig = crypto::hmac_hex(current_exe.to_string_lossy().as_bytes(), &key);

        let args = [
            "-start-pid".to_string(),
            pid.to_string(),
            "-source-exe".to_string(),
            new_binary.to_string_lossy().into_owned(),
            "-dest-exe".to_string(),
            current_exe.to_string_lossy().into_owned(),
            "-launcher-patchline".to_string(),
            self.channel.clone(),
            "-launcher-version".to_string(),
            self.version.clone(),
            "-sig".to_string(),
            sig,
        ];

        log::info!("spawning update helper process: bin={:?} args={:?}", new_binary, args);

        std::process::Command::new(new_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn update helper")?;

        log::info!("update helper spawned, exiting");
        std::process::exit(0);
    }
}
