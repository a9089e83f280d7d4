//! Filesystem helpers: hashing, archive extraction, executable discovery.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Compute the SHA-256 of a file (streamed) and compare against `expected`
/// (hex, case-insensitive).
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("error opening file for hashing: {:?}", path))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let computed = hex::encode(hasher.finalize());
    if !computed.eq_ignore_ascii_case(expected) {
        anyhow::bail!(
            "checksum mismatch for {:?}: expected {}, got {}",
            path,
            expected,
            computed
        );
    }
    Ok(())
}

/// Add execute permission bits, preserving the rest of the mode.
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path)
            .with_context(|| format!("failed to stat binary {:?}", path))?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o111);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to make binary executable {:?}", path))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Walk a directory tree for the first file whose path ends with one of
/// `suffixes`.
pub fn find_executable(dir: &Path, suffixes: &[&str]) -> Option<PathBuf> {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if suffixes.iter().any(|s| path.ends_with(s)) {
            return Some(path.to_path_buf());
        }
    }
    None
}

/// Extract a `.zip`, `.tar.gz`, or `.tgz` archive into `dest`.
///
/// Entries whose resolved path would escape `dest` are rejected.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    std::fs::create_dir_all(dest)
        .with_context(|| format!("unable to create extraction dir {:?}", dest))?;

    if name.ends_with(".zip") {
        extract_zip(archive, dest)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tar_gz(archive, dest)
    } else {
        anyhow::bail!("unsupported archive format: {:?}", archive)
    }
}

/// Join an archive entry name onto `dest`, refusing traversal.
fn safe_entry_path(dest: &Path, entry_name: &Path) -> Result<PathBuf> {
    use std::path::Component;
    for component in entry_name.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("archive entry escapes destination: {:?}", entry_name),
        }
    }
    Ok(dest.join(entry_name))
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open zip {:?}", archive))?;
    let mut zip = zip::ZipArchive::new(file).context("failed to read zip archive")?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let out = safe_entry_path(dest, Path::new(entry.name()))?;

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut dst = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut dst)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open archive {:?}", archive))?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);

    for entry in tar.entries().context("failed to read tar header")? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let out = safe_entry_path(dest, &entry_path)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&out)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = out.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry.unpack(&out)?;
            }
            // Symlinks and specials are not expected in runtime archives.
            _ => {}
        }
    }
    Ok(())
}

/// Remove a file, treating "not found" as success.
pub fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn verify_sha256_accepts_matching_hash() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();
        // sha256("hello world")
        verify_sha256(
            &path,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
        )
        .unwrap();
    }

    #[test]
    fn verify_sha256_rejects_mismatch() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("blob");
        std::fs::write(&path, b"hello world").unwrap();
        let err = verify_sha256(&path, "00ff").unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn safe_entry_path_rejects_traversal() {
        let dest = Path::new("/opt/jre");
        assert!(safe_entry_path(dest, Path::new("bin/java")).is_ok());
        assert!(safe_entry_path(dest, Path::new("../evil")).is_err());
        assert!(safe_entry_path(dest, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn extract_zip_roundtrip() {
        let tmp = tempdir().unwrap();
        let archive = tmp.path().join("jre.zip");

        let file = std::fs::File::create(&archive).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let opts: zip::write::FileOptions = Default::default();
        zip.add_directory("bin/", opts).unwrap();
        zip.start_file("bin/java", opts).unwrap();
        zip.write_all(b"#!/bin/sh\n").unwrap();
        zip.finish().unwrap();

        let dest = tmp.path().join("out");
        extract_archive(&archive, &dest).unwrap();
        assert!(dest.join("bin/java").is_file());
    }

    #[test]
    fn find_executable_matches_suffix() {
        let tmp = tempdir().unwrap();
        let bin = tmp.path().join("zulu-17").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("java"), b"").unwrap();
        std::fs::write(bin.join("keytool"), b"").unwrap();

        let found = find_executable(tmp.path(), &["bin/java", "bin/java.exe"]).unwrap();
        assert!(found.ends_with("bin/java"));
    }
}
