//! Build-time identity and dev-mode environment toggles.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Release branch this binary was built for ("release", "beta", "dev").
/// Overridable at compile time, defaults to "dev" for local builds.
pub const RELEASE: &str = match option_env!("HYTALE_LAUNCHER_RELEASE") {
    Some(r) => r,
    None => "dev",
};

/// Human-readable build version string.
pub const VERSION: &str = match option_env!("HYTALE_LAUNCHER_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

static BUILD_NUMBER: Lazy<u64> = Lazy::new(|| {
    option_env!("HYTALE_LAUNCHER_BUILD")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
});

/// Monotonic build number assigned by CI; 0 for local builds.
pub fn build_number() -> u64 {
    *BUILD_NUMBER
}

pub fn is_dev() -> bool {
    RELEASE == "dev"
}

/// User agent sent on every HTTP request.
pub fn user_agent() -> String {
    if RELEASE == "release" {
        format!("hytale-launcher/{}", VERSION)
    } else {
        format!("hytale-launcher/{}/{}", RELEASE, VERSION)
    }
}

/// Canonical `{os, arch}` pair used in endpoints and persisted channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// Detect the host platform. Dev builds honor the
    /// `HYTALE_LAUNCHER_OS` / `HYTALE_LAUNCHER_ARCH` overrides.
    pub fn current() -> Self {
        Self {
            os: current_os(),
            arch: current_arch(),
        }
    }
}

fn current_os() -> String {
    if is_dev() {
        if let Ok(v) = std::env::var("HYTALE_LAUNCHER_OS") {
            return v;
        }
    }
    std::env::consts::OS.to_string()
}

fn current_arch() -> String {
    if is_dev() {
        if let Ok(v) = std::env::var("HYTALE_LAUNCHER_ARCH") {
            return v;
        }
    }
    // The update endpoints use Go-style arch names.
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
    .to_string()
}

/// Dev-only override forcing offline mode at startup.
pub fn offline_mode_forced() -> bool {
    is_dev() && std::env::var_os("HYTALE_LAUNCHER_OFFLINE_MODE").is_some()
}

pub fn debug_logging() -> bool {
    if is_dev() {
        return true;
    }
    std::env::var_os("HYTALE_LAUNCHER_DEBUG_LOGGING").is_some()
}

/// Whether freshly installed binaries get a smoke-test run. Dev builds can
/// opt out via `HYTALE_LAUNCHER_NO_TEST_RUN_BINARIES`.
pub fn test_run_binaries() -> bool {
    if is_dev() {
        return std::env::var_os("HYTALE_LAUNCHER_NO_TEST_RUN_BINARIES").is_none();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_includes_release_for_dev_builds() {
        let ua = user_agent();
        assert!(ua.starts_with("hytale-launcher/"));
        if RELEASE != "release" {
            assert!(ua.contains(RELEASE));
        }
    }

    #[test]
    fn platform_uses_wire_arch_names() {
        let p = Platform::current();
        assert!(!p.os.is_empty());
        assert_ne!(p.arch, "x86_64");
        assert_ne!(p.arch, "aarch64");
    }
}
