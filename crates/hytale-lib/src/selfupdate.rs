//! Self-update helper mode.
//!
//! The freshly downloaded binary is started with a signed argument vector
//! describing the swap. Before touching anything it re-derives the
//! signature from the keyring, confines both paths to the OS temp prefix,
//! waits for the old process to die, and only then replaces the binary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

use crate::crypto;
use crate::storage::Storage;
use crate::utils;

const PROCESS_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Parsed self-update argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfUpdateArgs {
    pub source_exe: PathBuf,
    pub dest_exe: PathBuf,
    pub start_pid: Option<u32>,
    pub patchline: Option<String>,
    pub version: Option<String>,
    pub sig: String,
}

impl SelfUpdateArgs {
    /// Recognize the helper-mode argv. Returns `None` unless both
    /// `-source-exe` and `-dest-exe` are present.
    pub fn parse<I>(args: I) -> Option<SelfUpdateArgs>
    where
        I: IntoIterator<Item = String>,
    {
        let mut source_exe = None;
        let mut dest_exe = None;
        let mut start_pid = None;
        let mut patchline = None;
        let mut version = None;
        let mut sig = None;

        let mut iter = args.into_iter();
        while let Some(flag) = iter.next() {
            match flag.as_str() {
                "-source-exe" => source_exe = iter.next().map(PathBuf::from),
                "-dest-exe" => dest_exe = iter.next().map(PathBuf::from),
                "-start-pid" => start_pid = iter.next().and_then(|v| v.parse().ok()),
                "-launcher-patchline" => patchline = iter.next(),
                "-launcher-version" => version = iter.next(),
                "-sig" => sig = iter.next(),
                _ => {}
            }
        }

        Some(SelfUpdateArgs {
            source_exe: source_exe?,
            dest_exe: dest_exe?,
            start_pid,
            patchline,
            version,
            sig: sig.unwrap_or_default(),
        })
    }

    pub fn from_env() -> Option<SelfUpdateArgs> {
        Self::parse(std::env::args().skip(1))
    }
}

/// Note left behind for the next run to observe which version was replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupNote {
    pub channel: String,
    pub version: String,
}

impl CleanupNote {
    pub fn write(&self, storage: &Storage) -> Result<()> {
        storage.ensure_root()?;
        let path = storage.in_storage("selfupdate-note.json");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("unable to write cleanup note {:?}", path))?;
        Ok(())
    }

    pub fn read(storage: &Storage) -> Result<Option<CleanupNote>> {
        let path = storage.in_storage("selfupdate-note.json");
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(storage: &Storage) {
        let _ = utils::remove_file_if_exists(&storage.in_storage("selfupdate-note.json"));
    }
}

/// Verify the handoff: the signature must be the HMAC of the destination
/// path under the keyring key, and both executables must live under the
/// temp prefix (the first hop is always downloaded there, so anything else
/// means a forged argv).
pub fn validate(args: &SelfUpdateArgs, key: &[u8], tmp_prefix: &Path) -> Result<()> {
    let expected = crypto::hmac_hex(
        args.dest_exe.to_string_lossy().as_bytes(),
        key,
    );
    if expected != args.sig {
        anyhow::bail!("invalid update signature");
    }

    if !args.source_exe.starts_with(tmp_prefix) || !args.dest_exe.starts_with(tmp_prefix) {
        anyhow::bail!("invalid update executables");
    }

    Ok(())
}

fn process_exists(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from_u32(pid))
}

/// Poll until the parent has exited. A hung parent only delays the swap by
/// the timeout; the helper proceeds with a warning.
fn wait_for_process_exit(pid: u32) {
    log::info!("waiting for parent process to exit: pid={}", pid);

    let deadline = Instant::now() + PROCESS_WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            log::debug!("parent process has exited: pid={}", pid);
            return;
        }
        std::thread::sleep(PROCESS_CHECK_INTERVAL);
    }

    log::warn!("timed out waiting for parent process to exit: pid={}", pid);
}

/// Remove the destination and copy the source into place. A destination
/// that is already gone counts as success.
fn replace_bin(source: &Path, dest: &Path) -> Result<()> {
    log::info!("replacing binary: {:?} -> {:?}", source, dest);

    utils::remove_file_if_exists(dest).context("failed to remove existing executable")?;

    let data = std::fs::read(source).context("error reading source binary")?;
    std::fs::write(dest, data).context("error writing destination binary")?;
    utils::make_executable(dest)?;
    Ok(())
}

/// Perform the swap. On success the replaced binary is relaunched in user
/// context and this function returns `Ok`; the caller exits 0. Any failure
/// before the swap leaves the original binary untouched.
pub fn run(args: &SelfUpdateArgs, storage: &Storage) -> Result<()> {
    let key = crypto::load_self_update_key().context("error fetching self-update key")?;
    validate(args, &key, &std::env::temp_dir()).context("update validation failed")?;

    log::info!(
        "performing update: source={:?} target={:?}",
        args.source_exe,
        args.dest_exe
    );

    if let Some(pid) = args.start_pid {
        wait_for_process_exit(pid);
    }

    replace_bin(&args.source_exe, &args.dest_exe)?;

    if let (Some(channel), Some(version)) = (&args.patchline, &args.version) {
        let note = CleanupNote {
            channel: channel.clone(),
            version: version.clone(),
        };
        if let Err(err) = note.write(storage) {
            log::error!("failed to write self-update note file: {:#}", err);
        }
    }

    log::info!("launching updated process: {:?}", args.dest_exe);
    std::process::Command::new(&args.dest_exe)
        .spawn()
        .context("failed to launch target executable")?;

    Ok(())
}
