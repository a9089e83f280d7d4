//! Periodic background refresh.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs a refresh closure on a fixed interval until stopped or dropped.
pub struct Refresher {
    handle: JoinHandle<()>,
}

impl Refresher {
    /// The first tick fires one full interval after start.
    pub fn start<F, Fut>(interval: Duration, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval() fires immediately; swallow the first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = refresh().await {
                    log::warn!("background refresh failed: {:#}", err);
                }
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_on_the_interval() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let _refresher = Refresher::start(Duration::from_secs(3600), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        // Let the refresher task register its timer before advancing time.
        tokio::task::yield_now().await;

        // Nothing before the first interval elapses.
        tokio::time::advance(Duration::from_secs(1800)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1801)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_the_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let refresher = Refresher::start(Duration::from_secs(60), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        refresher.stop();
        tokio::time::advance(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
