//! Online/offline mode machine.
//!
//! Every online-only subsystem checks the monitor first and fails fast with
//! [`OfflineError`] instead of touching the network.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::build;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel returned by any online-only operation while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("launcher is in offline mode")]
pub struct OfflineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Online,
    Offline,
}

pub struct NetMonitor {
    offline: AtomicBool,
    client: reqwest::Client,
    probe_url: String,
}

impl NetMonitor {
    /// `probe_url` is a well-known endpoint answering cheap GETs.
    pub fn new(client: reqwest::Client, probe_url: String) -> Self {
        Self {
            offline: AtomicBool::new(build::offline_mode_forced()),
            client,
            probe_url,
        }
    }

    pub fn current(&self) -> Mode {
        if self.offline.load(Ordering::SeqCst) {
            Mode::Offline
        } else {
            Mode::Online
        }
    }

    /// Set the mode. Returns true when the mode actually changed. The dev
    /// override pins the machine to offline.
    pub fn set_mode(&self, mode: Mode) -> bool {
        let target = if build::offline_mode_forced() {
            Mode::Offline
        } else {
            mode
        };
        let was_offline = self.offline.swap(target == Mode::Offline, Ordering::SeqCst);
        let changed = was_offline != (target == Mode::Offline);
        if changed {
            log::info!("network mode changed: {:?}", target);
        }
        changed
    }

    /// Fail fast when offline.
    pub fn offline_error(&self) -> Result<(), OfflineError> {
        match self.current() {
            Mode::Offline => Err(OfflineError),
            Mode::Online => Ok(()),
        }
    }

    /// Probe connectivity with a short timeout. Any response at all counts;
    /// only transport-level failure means unreachable.
    pub async fn check_connectivity(&self) -> bool {
        let result = self
            .client
            .get(&self.probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(_) => true,
            Err(err) => {
                log::debug!("connectivity probe failed: {}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> NetMonitor {
        NetMonitor::new(reqwest::Client::new(), "http://127.0.0.1:0/".into())
    }

    #[test]
    fn starts_online_and_transitions() {
        let net = monitor();
        assert_eq!(net.current(), Mode::Online);
        assert!(net.offline_error().is_ok());

        assert!(net.set_mode(Mode::Offline));
        assert_eq!(net.current(), Mode::Offline);
        assert_eq!(net.offline_error(), Err(OfflineError));

        // No-op transition reports unchanged.
        assert!(!net.set_mode(Mode::Offline));
        assert!(net.set_mode(Mode::Online));
    }

    #[tokio::test]
    async fn probe_reports_unreachable_endpoint() {
        // Nothing listens on the discard port; connection is refused.
        let net = NetMonitor::new(reqwest::Client::new(), "http://127.0.0.1:9/".into());
        assert!(!net.check_connectivity().await);
    }
}
