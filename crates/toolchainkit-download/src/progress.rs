use std::fmt;
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Weight of the newest throughput sample in the moving average.
const SPEED_SMOOTHING: f64 = 0.3;

/// Point-in-time view of a running download. Never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    /// Total size in bytes, or 0 when the server did not say.
    pub total_bytes: u64,
    /// 0.0..=100.0; always 0.0 when the total is unknown.
    pub percentage: f64,
    /// Smoothed throughput.
    pub speed_bytes_per_sec: f64,
    pub eta: Option<Duration>,
}

impl DownloadProgress {
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.downloaded_bytes >= self.total_bytes
    }
}

impl fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let downloaded = self.downloaded_bytes as f64 / BYTES_PER_MB;
        let speed = self.speed_bytes_per_sec / BYTES_PER_MB;
        if self.total_bytes > 0 {
            let total = self.total_bytes as f64 / BYTES_PER_MB;
            write!(
                f,
                "{downloaded:.1}/{total:.1} MB ({:.1}%) at {speed:.1} MB/s",
                self.percentage
            )?;
        } else {
            write!(f, "{downloaded:.1} MB at {speed:.1} MB/s")?;
        }
        if let Some(eta) = self.eta {
            write!(f, " ETA: {}s", eta.as_secs())?;
        }
        Ok(())
    }
}

/// Throttles progress callbacks to at most one per `interval`, plus a final report.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    interval: Duration,
    total_bytes: u64,
    downloaded_bytes: u64,
    last_report_at: Instant,
    last_report_bytes: u64,
    speed: Option<f64>,
}

impl ProgressTracker {
    pub(crate) fn new(already_downloaded: u64, total_bytes: u64, interval: Duration) -> Self {
        Self {
            interval,
            total_bytes,
            downloaded_bytes: already_downloaded,
            last_report_at: Instant::now(),
            last_report_bytes: already_downloaded,
            speed: None,
        }
    }

    pub(crate) fn advance(&mut self, bytes: u64, sink: &mut dyn FnMut(&DownloadProgress)) {
        self.downloaded_bytes = self.downloaded_bytes.saturating_add(bytes);
        let now = Instant::now();
        if now.duration_since(self.last_report_at) >= self.interval {
            let snapshot = self.sample(now);
            sink(&snapshot);
        }
    }

    pub(crate) fn finish(&mut self, sink: &mut dyn FnMut(&DownloadProgress)) {
        let snapshot = self.sample(Instant::now());
        sink(&snapshot);
    }

    fn sample(&mut self, now: Instant) -> DownloadProgress {
        let elapsed = now.duration_since(self.last_report_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta = self.downloaded_bytes.saturating_sub(self.last_report_bytes) as f64;
            let instantaneous = delta / elapsed;
            self.speed = Some(match self.speed {
                Some(prev) => SPEED_SMOOTHING * instantaneous + (1.0 - SPEED_SMOOTHING) * prev,
                None => instantaneous,
            });
        }
        self.last_report_at = now;
        self.last_report_bytes = self.downloaded_bytes;

        let speed = self.speed.unwrap_or(0.0);
        let percentage = if self.total_bytes > 0 {
            (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let eta = if self.total_bytes > 0 && speed > 0.0 {
            let remaining = self.total_bytes.saturating_sub(self.downloaded_bytes) as f64;
            Some(Duration::from_secs_f64(remaining / speed))
        } else {
            None
        };

        DownloadProgress {
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            percentage,
            speed_bytes_per_sec: speed,
            eta,
        }
    }
}
