//! Streamed download engine.
//!
//! Bodies stream into uniquely named files under the storage cache
//! directory. Partial files never survive a failure: the scratch path is a
//! tempfile guard that deletes on drop unless the download completes.

use anyhow::{Context, Result};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::update::types::CancelToken;

pub mod reporter;
pub use reporter::Reporter;

/// Download `url` into a fresh file under `cache_dir`.
///
/// When `expected_sha256` is given the stream is hashed as it lands and a
/// mismatch fails the download. Cancellation is checked per chunk; the
/// partial file is removed on every failure path.
pub async fn download_to_temp(
    token: &CancelToken,
    client: &reqwest::Client,
    cache_dir: &Path,
    url: &str,
    expected_sha256: Option<&str>,
    reporter: &Reporter,
) -> Result<PathBuf> {
    log::debug!("downloading: {}", url);

    tokio::fs::create_dir_all(cache_dir)
        .await
        .with_context(|| format!("unable to create cache directory {:?}", cache_dir))?;

    // Reserve a unique path; the guard deletes it unless we keep() at the
    // end. The URL's file name is kept as a suffix so consumers can
    // dispatch on the extension.
    let url_name = url
        .split(['?', '#'])
        .next()
        .and_then(|p| p.rsplit('/').next())
        .unwrap_or_default();
    let suffix = if url_name.is_empty() {
        String::new()
    } else {
        format!("-{}", url_name)
    };
    let scratch = tempfile::Builder::new()
        .prefix("download-")
        .suffix(&suffix)
        .tempfile_in(cache_dir)
        .context("unable to create download scratch file")?
        .into_temp_path();

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("request failed: {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP error {}: {}", response.status(), url);
    }

    let total = response.content_length();
    let mut file = tokio::fs::File::create(&scratch)
        .await
        .with_context(|| format!("unable to open {:?}", scratch))?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if token.is_cancelled() {
            log::warn!("download cancelled: {}", url);
            anyhow::bail!("download cancelled");
        }

        let chunk = chunk.with_context(|| format!("stream error: {}", url))?;
        file.write_all(&chunk).await?;
        if expected_sha256.is_some() {
            hasher.update(&chunk);
        }

        downloaded += chunk.len() as u64;
        reporter.update_bytes(downloaded, total);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = expected_sha256 {
        let computed = hex::encode(hasher.finalize());
        if !computed.eq_ignore_ascii_case(expected) {
            anyhow::bail!(
                "checksum mismatch for {}: expected {}, got {}",
                url,
                expected,
                computed
            );
        }
        log::debug!("checksum validated: {}", computed);
    }

    let path = scratch.keep().context("unable to persist download")?;
    log::debug!("download complete: {} -> {:?} ({} bytes)", url, path, downloaded);
    Ok(path)
}
