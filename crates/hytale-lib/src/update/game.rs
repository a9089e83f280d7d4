//! Game updates: an ordered chain of binary patches plus rolling
//! signatures, downloaded up front, applied strictly in order, committed by
//! moving the final signature into the install.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::auth::account::Auth;
use crate::download::{self, Reporter};
use crate::state::{ChannelState, Dep, PKG_GAME};
use crate::update::types::{
    CancelToken, StatusCallback, UpdateStatus, STATE_APPLYING_PATCH, STATE_COMPLETE,
    STATE_DOWNLOADING_PATCH, STATE_DOWNLOADING_SIGNATURE, STATE_VALIDATING_PATCH,
};
use crate::update::Updater;

/// One binary patch step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub from_build: u64,
    pub to_build: u64,
    pub patch_url: String,
    #[serde(default)]
    pub patch_size: u64,
    pub sig_url: String,
    #[serde(default)]
    pub sig_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    pub steps: Vec<Patch>,
}

impl PatchSet {
    /// Chain validity: the first step starts at the current build, each
    /// step continues where the previous ended, and the last step lands on
    /// the target build. Checked before any I/O.
    pub fn validate(&self, current_build: u64, target_build: u64) -> Result<()> {
        let first = self
            .steps
            .first()
            .context("patch set contains no steps")?;
        if first.from_build != current_build {
            anyhow::bail!(
                "patch chain starts at build {}, install is at {}",
                first.from_build,
                current_build
            );
        }
        for pair in self.steps.windows(2) {
            if pair[1].from_build != pair[0].to_build {
                anyhow::bail!(
                    "patch chain breaks between builds {} and {}",
                    pair[0].to_build,
                    pair[1].from_build
                );
            }
        }
        let last = self.steps.last().unwrap();
        if last.to_build != target_build {
            anyhow::bail!(
                "patch chain ends at build {}, target is {}",
                last.to_build,
                target_build
            );
        }
        Ok(())
    }

    /// Drop duplicate steps sharing a `from_build`, keeping the one with
    /// the larger `to_build`, and order the rest by `from_build`.
    pub fn normalize(&mut self) {
        self.steps
            .sort_by(|a, b| a.from_build.cmp(&b.from_build).then(b.to_build.cmp(&a.to_build)));
        self.steps.dedup_by_key(|s| s.from_build);
    }
}

/// Fetch the patch chain advancing `from_build` to the channel's newest
/// build.
pub async fn fetch_patch_set(
    updater: &Updater,
    auth: &Auth,
    channel: &str,
    from_build: u64,
) -> Result<PatchSet> {
    updater.net.offline_error()?;

    let url = updater
        .endpoints
        .game_patch_set(&updater.platform, channel, from_build);
    let response = updater
        .client
        .get(&url)
        .bearer_auth(&auth.token)
        .send()
        .await
        .with_context(|| format!("failed to fetch patch set for channel {}", channel))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error {} fetching patch set {}", response.status(), url);
    }

    let mut set: PatchSet = response
        .json()
        .await
        .context("failed to decode patch set")?;
    set.normalize();

    log::debug!(
        "received patch set: channel={} steps={:?}",
        channel,
        set.steps
            .iter()
            .map(|s| format!("{}->{}", s.from_build, s.to_build))
            .collect::<Vec<_>>()
    );
    Ok(set)
}

/// A pending game update for one channel.
#[derive(Debug, Clone)]
pub struct GameUpdate {
    pub channel: String,
    pub current: Option<Dep>,
    pub target_build: u64,
    pub version: String,
    pub patches: PatchSet,
}

/// Per-step scratch files produced by the download phase.
struct StepFiles {
    patch_path: PathBuf,
    sig_path: PathBuf,
}

impl GameUpdate {
    /// Check for a game update against the account's patchline index.
    pub async fn check(
        updater: &Updater,
        state: &ChannelState,
        auth: &Auth,
        channel: &str,
    ) -> Result<Option<GameUpdate>> {
        let account = auth
            .account
            .as_ref()
            .context("no authenticated account available for update check")?;
        let patchline = account
            .patchlines
            .get(channel)
            .with_context(|| format!("no patchline available for channel {}", channel))?;

        log::debug!(
            "patchline index: channel={} newest_build={} version={}",
            channel,
            patchline.newest_build,
            patchline.version
        );

        if patchline.newest_build < 1 {
            anyhow::bail!("no builds available for channel {}", channel);
        }

        // A platform mismatch invalidates whatever is on disk.
        let current = if state.platform_matches() {
            state.first_dep(PKG_GAME).cloned()
        } else {
            None
        };
        let current_build = current.as_ref().map(|d| d.build).unwrap_or(0);

        if current_build == patchline.newest_build {
            return Ok(None);
        }

        let patches = fetch_patch_set(updater, auth, channel, current_build)
            .await
            .with_context(|| format!("error getting patch set for channel {}", channel))?;
        patches.validate(current_build, patchline.newest_build)?;

        Ok(Some(GameUpdate {
            channel: channel.to_string(),
            current,
            target_build: patchline.newest_build,
            version: patchline.version.clone(),
            patches,
        }))
    }

    /// Apply the update: download every step, then patch and validate each
    /// in order, then commit.
    pub async fn apply(
        &self,
        token: &CancelToken,
        updater: &Updater,
        state: &mut ChannelState,
        reporter: &StatusCallback,
    ) -> Result<()> {
        log::info!(
            "applying game update: channel={} from={:?} to={}",
            self.channel,
            self.current.as_ref().map(|d| d.build),
            self.target_build
        );

        let game_dir = updater.storage.package_dir(PKG_GAME, &self.channel);
        tokio::fs::create_dir_all(&game_dir)
            .await
            .with_context(|| format!("unable to create game directory {:?}", game_dir))?;

        // Download phase. All steps land on disk before the first apply so
        // apply-time failures are never compounded by fetch failures.
        let mut files: Vec<StepFiles> = Vec::with_capacity(self.patches.steps.len());
        for (i, step) in self.patches.steps.iter().enumerate() {
            token.bail_if_cancelled()?;
            match self.download_step(token, updater, step, i, reporter).await {
                Ok(f) => files.push(f),
                Err(err) => return self.fallback(&files, err),
            }
        }

        // Apply phase, strictly sequential. Downloads cover the first half
        // of the progress range, applies the second, keeping the overall
        // report monotonic.
        let total = self.patches.steps.len();
        for (i, step) in self.patches.steps.iter().enumerate() {
            token.bail_if_cancelled()?;
            let step_files = &files[i];

            if let Err(err) = self
                .apply_step(token, updater, step, step_files, &game_dir, i, total, reporter)
                .await
            {
                return self.fallback(&files, err);
            }

            reporter(UpdateStatus::new(
                STATE_APPLYING_PATCH,
                0.5 + 0.5 * (i + 1) as f64 / total as f64,
            ));
        }

        // Commit phase.
        let sig_dest = game_dir.join(".signature");
        let last = files.last().context("empty patch set after apply")?;
        move_file(&last.sig_path, &sig_dest)
            .await
            .context("failed to save rolling signature")?;

        self.delete_patch_files(&files).await;

        // Retire every previously recorded version before recording the
        // new one.
        let old_versions: Vec<String> = state
            .get_deps(PKG_GAME)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        for version in old_versions {
            state.remove_dependency(PKG_GAME, &version);
        }

        state.set_dependency(
            PKG_GAME,
            "update",
            Some(Dep {
                version: self.version.clone(),
                build: self.target_build,
                path: game_dir.to_string_lossy().into_owned(),
                sig_dir: game_dir.to_string_lossy().into_owned(),
                sig_file: ".signature".into(),
                ..Default::default()
            }),
        );

        reporter(UpdateStatus::new(STATE_COMPLETE, 1.0));
        Ok(())
    }

    /// Download one step's patch (90% of the step slot) and signature (10%).
    async fn download_step(
        &self,
        token: &CancelToken,
        updater: &Updater,
        step: &Patch,
        idx: usize,
        reporter: &StatusCallback,
    ) -> Result<StepFiles> {
        let total = self.patches.steps.len();
        // Downloads occupy [0, 0.5] of the update's slot; within one step
        // the patch is 90% of the weight and the signature 10%.
        let base = 0.5 * idx as f64 / total as f64;
        let patch_weight = (0.5 / total as f64) * 0.9;
        let sig_weight = (0.5 / total as f64) * 0.1;

        log::debug!("downloading patch: from={} to={}", step.from_build, step.to_build);

        let step_data = json!({ "current": idx + 1, "total": total });
        let cache_dir = updater.storage.cache_dir();

        let patch_reporter = Reporter::new(
            STATE_DOWNLOADING_PATCH,
            Some(step_data.clone()),
            patch_weight,
            base,
            Some(step.patch_size).filter(|s| *s > 0),
            reporter.clone(),
        );
        let patch_path = download::download_to_temp(
            token,
            &updater.client,
            &cache_dir,
            &step.patch_url,
            None,
            &patch_reporter,
        )
        .await?;

        let sig_reporter = Reporter::new(
            STATE_DOWNLOADING_SIGNATURE,
            Some(step_data),
            sig_weight,
            base + patch_weight,
            Some(step.sig_size).filter(|s| *s > 0),
            reporter.clone(),
        );
        let sig_path = download::download_to_temp(
            token,
            &updater.client,
            &cache_dir,
            &step.sig_url,
            None,
            &sig_reporter,
        )
        .await?;

        Ok(StepFiles {
            patch_path,
            sig_path,
        })
    }

    /// Run the patch tool and the validator for one step inside a fresh
    /// staging directory.
    #[allow(clippy::too_many_arguments)]
    async fn apply_step(
        &self,
        token: &CancelToken,
        updater: &Updater,
        step: &Patch,
        files: &StepFiles,
        game_dir: &Path,
        idx: usize,
        total: usize,
        reporter: &StatusCallback,
    ) -> Result<()> {
        let progress = 0.5 + 0.5 * idx as f64 / total as f64;

        log::info!("applying patch: from={} to={}", step.from_build, step.to_build);
        reporter(UpdateStatus::new(STATE_APPLYING_PATCH, progress));

        // Staging removed on every exit path by the tempdir guard.
        let staging = mk_staging_dir()?;

        updater
            .patch_tool
            .apply(token, &files.patch_path, &files.sig_path, game_dir, staging.path())
            .await?;

        log::info!("validating patch: from={} to={}", step.from_build, step.to_build);
        reporter(UpdateStatus::new(STATE_VALIDATING_PATCH, progress));
        updater
            .patch_tool
            .verify(token, &files.sig_path, game_dir)
            .await?;

        Ok(())
    }

    /// Clean up downloads and surface the original error untouched. Replans
    /// happen on the next coordinator run; there is no automatic reinstall.
    fn fallback(&self, files: &[StepFiles], original: anyhow::Error) -> Result<()> {
        log::error!("game update failed: {:#}", original);
        for f in files {
            let _ = std::fs::remove_file(&f.patch_path);
            let _ = std::fs::remove_file(&f.sig_path);
        }
        Err(original)
    }

    /// Remove downloaded scratch files, in parallel.
    async fn delete_patch_files(&self, files: &[StepFiles]) {
        let removals = files.iter().flat_map(|f| {
            [f.patch_path.clone(), f.sig_path.clone()]
        });
        let tasks = removals.map(|path| async move {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove patch scratch file {:?}: {}", path, err);
                }
            }
        });
        futures::future::join_all(tasks).await;
    }
}

/// Staging prefers $TMPDIR, then $XDG_CACHE_HOME, then the OS default; the
/// name is unique per attempt.
fn mk_staging_dir() -> Result<tempfile::TempDir> {
    let builder = || {
        let mut b = tempfile::Builder::new();
        b.prefix("hytale-patch-staging-");
        b
    };
    if let Some(dir) = std::env::var_os("TMPDIR") {
        return builder()
            .tempdir_in(dir)
            .context("failed to create staging directory in $TMPDIR");
    }
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        return builder()
            .tempdir_in(dir)
            .context("failed to create staging directory in $XDG_CACHE_HOME");
    }
    builder()
        .tempdir()
        .context("failed to create staging directory")
}

/// Rename, falling back to copy+remove across filesystems.
async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(src, dest)
                .await
                .with_context(|| format!("failed to copy {:?} -> {:?}", src, dest))?;
            let _ = tokio::fs::remove_file(src).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(from: u64, to: u64) -> Patch {
        Patch {
            from_build: from,
            to_build: to,
            patch_url: format!("https://cdn/patch-{}-{}", from, to),
            patch_size: 1024,
            sig_url: format!("https://cdn/sig-{}", to),
            sig_size: 64,
        }
    }

    #[test]
    fn valid_chain_passes() {
        let set = PatchSet {
            steps: vec![patch(40, 41), patch(41, 42)],
        };
        set.validate(40, 42).unwrap();
    }

    #[test]
    fn empty_set_is_invalid() {
        let set = PatchSet::default();
        assert!(set.validate(40, 42).is_err());
    }

    #[test]
    fn chain_must_start_at_current_build() {
        let set = PatchSet {
            steps: vec![patch(41, 42)],
        };
        let err = set.validate(40, 42).unwrap_err();
        assert!(err.to_string().contains("starts at build 41"));
    }

    #[test]
    fn chain_must_be_contiguous() {
        let set = PatchSet {
            steps: vec![patch(40, 41), patch(43, 44)],
        };
        assert!(set.validate(40, 44).is_err());
    }

    #[test]
    fn chain_must_end_at_target() {
        let set = PatchSet {
            steps: vec![patch(40, 41)],
        };
        assert!(set.validate(40, 42).is_err());
    }

    #[test]
    fn normalize_prefers_larger_to_build_on_shared_from() {
        let mut set = PatchSet {
            steps: vec![patch(41, 42), patch(40, 41), patch(40, 42)],
        };
        set.normalize();
        assert_eq!(
            set.steps
                .iter()
                .map(|s| (s.from_build, s.to_build))
                .collect::<Vec<_>>(),
            vec![(40, 42), (41, 42)]
        );
    }

    #[test]
    fn staging_dir_is_unique_and_removed() {
        let a = mk_staging_dir().unwrap();
        let b = mk_staging_dir().unwrap();
        assert_ne!(a.path(), b.path());

        let path = a.path().to_path_buf();
        assert!(path.exists());
        drop(a);
        assert!(!path.exists());
    }
}
