//! Driver for the external binary patch tool.
//!
//! The patch format is opaque here: applying a step and validating the
//! result are subprocess invocations, and cancellation kills the child.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::storage::Storage;
use crate::update::types::CancelToken;

#[derive(Debug, Clone)]
pub struct PatchTool {
    bin: PathBuf,
}

impl PatchTool {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// The tool ships alongside the launcher's storage tree.
    pub fn bundled(storage: &Storage) -> Self {
        let name = if cfg!(windows) {
            "hytale-patcher.exe"
        } else {
            "hytale-patcher"
        };
        Self::new(storage.in_storage("tools").join(name))
    }

    /// Rewrite `game_dir` in place using `staging_dir` as scratch.
    pub async fn apply(
        &self,
        token: &CancelToken,
        patch_file: &Path,
        prior_sig_file: &Path,
        game_dir: &Path,
        staging_dir: &Path,
    ) -> Result<()> {
        self.run(
            token,
            &[
                "apply".as_ref(),
                "--patch".as_ref(),
                patch_file.as_os_str(),
                "--signature".as_ref(),
                prior_sig_file.as_os_str(),
                "--dir".as_ref(),
                game_dir.as_os_str(),
                "--staging".as_ref(),
                staging_dir.as_os_str(),
            ],
        )
        .await
        .context("failed to apply patch")
    }

    /// Check `dir` against a rolling signature; non-zero exit fails.
    pub async fn verify(&self, token: &CancelToken, sig_file: &Path, dir: &Path) -> Result<()> {
        self.run(
            token,
            &[
                "verify".as_ref(),
                "--signature".as_ref(),
                sig_file.as_os_str(),
                "--dir".as_ref(),
                dir.as_os_str(),
            ],
        )
        .await
        .context("validation failed")
    }

    async fn run(&self, token: &CancelToken, args: &[&std::ffi::OsStr]) -> Result<()> {
        log::debug!("running patch tool: {:?} {:?}", self.bin, args);

        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start patch tool {:?}", self.bin))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = token.cancelled() => {
                // kill_on_drop reaps the child when the future is dropped.
                anyhow::bail!("patch tool cancelled");
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "patch tool exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn stub_tool(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("patcher");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{}", script).unwrap();
        drop(f);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let tmp = tempdir().unwrap();
        let tool = PatchTool::new(stub_tool(tmp.path(), "exit 0"));
        let token = CancelToken::none();
        tool.verify(&token, Path::new("/sig"), Path::new("/dir"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let tmp = tempdir().unwrap();
        let tool = PatchTool::new(stub_tool(tmp.path(), "echo corrupt >&2; exit 3"));
        let token = CancelToken::none();
        let err = tool
            .verify(&token, Path::new("/sig"), Path::new("/dir"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("corrupt"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let tmp = tempdir().unwrap();
        let tool = PatchTool::new(stub_tool(tmp.path(), "sleep 30"));
        let (tx, token) = CancelToken::pair();

        let handle = {
            let tool = tool.clone();
            tokio::spawn(async move {
                tool.verify(&token, Path::new("/sig"), Path::new("/dir")).await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(format!("{:#}", err).contains("cancelled"));
    }

    #[tokio::test]
    async fn missing_tool_is_an_error() {
        let tool = PatchTool::new("/nonexistent/patcher");
        let token = CancelToken::none();
        assert!(tool
            .verify(&token, Path::new("/sig"), Path::new("/dir"))
            .await
            .is_err());
    }
}
