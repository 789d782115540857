use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{sync::Mutex, time::Instant};

/// Smoothing factor of the rates, higher values follow changes faster.
const EMA_ALPHA: f64 = 0.3;

/// Moving averages of one transfer window.
#[derive(Debug)]
struct Window {
    last_update: Instant,
    download: f64,
    upload: f64,
}

/// Transfer counter of a peer or of a whole session. Bytes are recorded as
/// they arrive, the rates are smoothed with an exponential moving average
/// every time [`Counter::update_rates`] is called.
#[derive(Debug)]
pub struct Counter {
    total_downloaded: AtomicU64,
    total_uploaded: AtomicU64,

    download_rate: AtomicU64,
    upload_rate: AtomicU64,

    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    window: Mutex<Window>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            window: Mutex::new(Window {
                last_update: Instant::now(),
                download: 0.0,
                upload: 0.0,
            }),
        }
    }
}

fn smooth(prev: f64, sample: f64) -> f64 {
    if prev == 0.0 {
        sample
    } else {
        EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Close the current window and fold its bytes into the rates.
    pub async fn update_rates(&self) {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        let elapsed = now.duration_since(window.last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        window.download = smooth(window.download, downloaded as f64 / elapsed);
        window.upload = smooth(window.upload, uploaded as f64 / elapsed);
        window.last_update = now;

        self.download_rate.store(window.download as u64, Ordering::Relaxed);
        self.upload_rate.store(window.upload as u64, Ordering::Relaxed);
    }

    /// Download rate in bytes per second.
    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    /// Upload rate in bytes per second.
    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    pub fn total_download(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn total_upload(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn rates_follow_the_windows() {
        let counter = Counter::new();

        counter.record_download(1000);
        counter.record_upload(500);

        time::sleep(Duration::from_millis(100)).await;
        counter.update_rates().await;

        // first window sets the average directly, ~10_000 and ~5_000
        let dl1 = counter.download_rate();
        let ul1 = counter.upload_rate();
        assert!((2000..=11000).contains(&dl1), "{dl1}");
        assert!((1000..=5500).contains(&ul1), "{ul1}");

        // an empty window pulls the average down, but not to zero
        time::sleep(Duration::from_millis(100)).await;
        counter.update_rates().await;

        let dl2 = counter.download_rate();
        assert!(dl2 < dl1);
        assert!(dl2 > 0);

        assert_eq!(counter.total_download(), 1000);
        assert_eq!(counter.total_upload(), 500);
    }

    #[tokio::test]
    async fn update_too_soon_is_ignored() {
        let counter = Counter::new();
        counter.record_download(10);
        counter.update_rates().await;
        counter.update_rates().await;
        assert_eq!(counter.total_download(), 10);
    }
}
