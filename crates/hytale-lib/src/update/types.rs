//! Shared update-engine types: status reports and cancellation.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Update state keys as emitted to the UI.
pub const STATE_DOWNLOADING: &str = "downloading";
pub const STATE_DOWNLOADING_PATCH: &str = "downloading_patch";
pub const STATE_DOWNLOADING_SIGNATURE: &str = "downloading_patch_signature";
pub const STATE_APPLYING_PATCH: &str = "applying_patch";
pub const STATE_VALIDATING_PATCH: &str = "validating_patch";
pub const STATE_INSTALLING: &str = "installing";
pub const STATE_CANCELLED: &str = "cancelled";
pub const STATE_COMPLETE: &str = "complete";
pub const STATE_ERROR: &str = "error";

/// A progress snapshot for one update operation.
#[derive(Debug, Clone, Serialize, Default)]
pub struct UpdateStatus {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_data: Option<serde_json::Value>,
    pub progress: f64,
    pub cancelable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateStatus {
    pub fn new(state: &str, progress: f64) -> Self {
        Self {
            state: state.to_string(),
            progress,
            ..Default::default()
        }
    }
}

/// Callback receiving status snapshots. Shared between the coordinator and
/// sub-operations, each wrapping it to rescale progress into its own slot.
pub type StatusCallback = Arc<dyn Fn(UpdateStatus) + Send + Sync>;

/// Wrap a callback so progress `p` lands at `offset + p * scale`.
pub fn scaled(reporter: StatusCallback, offset: f64, scale: f64) -> StatusCallback {
    Arc::new(move |mut status: UpdateStatus| {
        status.progress = offset + status.progress * scale;
        reporter(status);
    })
}

/// A status callback that drops everything. Used by background work and
/// tests that don't care about progress.
pub fn silent() -> StatusCallback {
    Arc::new(|_| {})
}

/// Cooperative cancellation handle, shared across tasks.
///
/// Streaming loops poll [`is_cancelled`](CancelToken::is_cancelled);
/// subprocess drivers race [`cancelled`](CancelToken::cancelled) against the
/// child so the child is killed promptly.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A sender/token pair. Send `true` to cancel.
    pub fn pair() -> (watch::Sender<bool>, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelToken { rx })
    }

    /// A token that never cancels. The sender is dropped immediately;
    /// [`cancelled`](CancelToken::cancelled) handles the closed channel by
    /// pending forever.
    pub fn none() -> CancelToken {
        let (_tx, rx) = watch::channel(false);
        CancelToken { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: cancellation can no
                // longer happen.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Error out of the current operation if cancellation was requested.
    pub fn bail_if_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn cancel_token_observes_sender() {
        let (tx, token) = CancelToken::pair();
        assert!(!token.is_cancelled());
        assert!(token.bail_if_cancelled().is_ok());

        tx.send(true).unwrap();
        assert!(token.is_cancelled());
        assert!(token.bail_if_cancelled().is_err());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let (tx, token) = CancelToken::pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[test]
    fn scaled_reporter_maps_progress_into_slot() {
        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter: StatusCallback = Arc::new(move |s: UpdateStatus| {
            sink.lock().unwrap().push(s.progress);
        });

        let sub = scaled(reporter, 0.5, 0.25);
        sub(UpdateStatus::new(STATE_DOWNLOADING, 0.0));
        sub(UpdateStatus::new(STATE_DOWNLOADING, 1.0));

        assert_eq!(*seen.lock().unwrap(), vec![0.5, 0.75]);
    }
}
