//! Throttled download progress reporting.
//!
//! Raw byte counts arrive once per network chunk; the UI only needs about a
//! hundred events per download. The reporter collapses samples onto a 1%
//! progress grid plus the endpoints, and additionally reports when the
//! observed transfer speed moves to a different bucket.

use std::sync::Mutex;
use std::time::Instant;

use crate::update::types::{StatusCallback, UpdateStatus};

/// Speed buckets are whole MiB/s.
const SPEED_BUCKET: u64 = 1024 * 1024;

/// Minimum window for a speed sample. Shorter windows are noise and must
/// not defeat the throttle.
const SPEED_WINDOW_MS: u128 = 250;

struct Throttle {
    last_progress: f64,
    last_bucket: u64,
    reported: bool,
    window_start: Instant,
    window_bytes: u64,
}

/// Translates `(bytes_downloaded, total)` samples into scaled, throttled
/// [`UpdateStatus`] reports.
pub struct Reporter {
    status_key: String,
    state_data: Option<serde_json::Value>,
    scale: f64,
    offset: f64,
    /// Expected size when the server's content-length is unreliable.
    total_override: Option<u64>,
    callback: StatusCallback,
    throttle: Mutex<Throttle>,
}

impl Reporter {
    pub fn new(
        status_key: &str,
        state_data: Option<serde_json::Value>,
        scale: f64,
        offset: f64,
        total_override: Option<u64>,
        callback: StatusCallback,
    ) -> Self {
        Self {
            status_key: status_key.to_string(),
            state_data,
            scale,
            offset,
            total_override,
            callback,
            throttle: Mutex::new(Throttle {
                last_progress: 0.0,
                last_bucket: 0,
                reported: false,
                window_start: Instant::now(),
                window_bytes: 0,
            }),
        }
    }

    /// Feed one raw sample. Emits at most one status report.
    pub fn update_bytes(&self, downloaded: u64, total: Option<u64>) {
        let total = self.total_override.or(total);

        let fraction = match total {
            Some(t) if t > 0 => (downloaded.min(t) as f64) / (t as f64),
            _ => 0.0,
        };
        let progress = self.offset + fraction * self.scale;

        let mut th = self.throttle.lock().unwrap();

        // Instantaneous speed over the window since the last report. Only
        // trust the sample once the window is long enough to mean something.
        let bucket = if th.window_start.elapsed().as_millis() >= SPEED_WINDOW_MS {
            let elapsed = th.window_start.elapsed().as_secs_f64();
            let delta = downloaded.saturating_sub(th.window_bytes);
            ((delta as f64 / elapsed) as u64) / SPEED_BUCKET
        } else {
            th.last_bucket
        };

        let crossed_grid =
            (progress * 100.0).floor() > (th.last_progress * 100.0).floor();
        let at_start = !th.reported;
        let at_end = progress >= 0.99 && th.last_progress < 0.99;
        let speed_changed = th.reported && bucket != th.last_bucket;

        if !(crossed_grid || at_start || at_end || speed_changed) {
            return;
        }

        th.last_progress = progress;
        th.last_bucket = bucket;
        th.reported = true;
        th.window_start = Instant::now();
        th.window_bytes = downloaded;
        drop(th);

        (self.callback)(UpdateStatus {
            state: self.status_key.clone(),
            state_data: self.state_data.clone(),
            progress,
            cancelable: true,
            current: Some(downloaded),
            total,
            error: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::types::STATE_DOWNLOADING;
    use std::sync::Arc;

    fn collecting() -> (Arc<Mutex<Vec<UpdateStatus>>>, StatusCallback) {
        let seen: Arc<Mutex<Vec<UpdateStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: StatusCallback = Arc::new(move |s| sink.lock().unwrap().push(s));
        (seen, cb)
    }

    #[test]
    fn event_count_is_bounded_by_the_grid() {
        let (seen, cb) = collecting();
        let reporter = Reporter::new(STATE_DOWNLOADING, None, 1.0, 0.0, None, cb);

        // One sample per 4 KiB of a 100 MiB body: 25600 samples.
        let total = 100 * 1024 * 1024u64;
        let mut downloaded = 0u64;
        while downloaded < total {
            downloaded += 4096;
            reporter.update_bytes(downloaded.min(total), Some(total));
        }

        let events = seen.lock().unwrap();
        assert!(
            events.len() <= 105,
            "expected at most 105 events, got {}",
            events.len()
        );
        // First and last samples always make it through.
        assert!(events.first().unwrap().progress < 0.01);
        assert!(events.last().unwrap().progress >= 0.99);
    }

    #[test]
    fn progress_is_monotonic() {
        let (seen, cb) = collecting();
        let reporter = Reporter::new(STATE_DOWNLOADING, None, 1.0, 0.0, None, cb);

        let total = 10_000_000u64;
        for i in (0..=total).step_by(8192) {
            reporter.update_bytes(i, Some(total));
        }

        let events = seen.lock().unwrap();
        for pair in events.windows(2) {
            assert!(pair[1].progress >= pair[0].progress);
        }
    }

    #[test]
    fn scale_and_offset_place_progress_in_slot() {
        let (seen, cb) = collecting();
        let reporter = Reporter::new(STATE_DOWNLOADING, None, 0.5, 0.25, None, cb);

        reporter.update_bytes(0, Some(100));
        reporter.update_bytes(100, Some(100));

        let events = seen.lock().unwrap();
        assert_eq!(events.first().unwrap().progress, 0.25);
        assert_eq!(events.last().unwrap().progress, 0.75);
    }

    #[test]
    fn unknown_total_reports_offset_only() {
        let (seen, cb) = collecting();
        let reporter = Reporter::new(STATE_DOWNLOADING, None, 1.0, 0.1, None, cb);

        reporter.update_bytes(4096, None);
        reporter.update_bytes(8192, None);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].progress, 0.1);
        assert_eq!(events[0].total, None);
    }
}
