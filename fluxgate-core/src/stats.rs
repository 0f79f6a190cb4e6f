//! Aggregate transfer counters and the windowed rate sample.
//!
//! Sessions bump the atomic counters on every relayed chunk; readers take
//! snapshots without ever blocking relay I/O. Rates are recomputed at most
//! once per sampling window and cached between reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum elapsed time before the rate is recomputed.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// One rolling measurement of aggregate throughput.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateSample {
    pub tx_bytes_per_sec: f64,
    pub rx_bytes_per_sec: f64,
}

impl RateSample {
    /// Pre-formatted `[tx, rx]` strings for the binding surface.
    pub fn formatted(&self) -> [String; 2] {
        [
            format!("{}/s", format_bytes(self.tx_bytes_per_sec as u64)),
            format!("{}/s", format_bytes(self.rx_bytes_per_sec as u64)),
        ]
    }
}

struct SampleState {
    last_tx: u64,
    last_rx: u64,
    last_at: Instant,
    rate: RateSample,
}

/// Aggregate transfer statistics for one worker process.
pub struct TransferStats {
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    sample: Mutex<SampleState>,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            sample: Mutex::new(SampleState {
                last_tx: 0,
                last_rx: 0,
                last_at: Instant::now(),
                rate: RateSample::default(),
            }),
        }
    }

    /// Record bytes sent toward the remote.
    pub fn record_tx(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes received from the remote.
    pub fn record_rx(&self, bytes: u64) {
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total_tx(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn total_rx(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Current rate sample. Recomputed when at least one sampling window
    /// has elapsed since the previous computation, else the cached sample.
    pub fn sample(&self) -> RateSample {
        let mut state = match self.sample.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let elapsed = state.last_at.elapsed();
        if elapsed >= SAMPLE_WINDOW {
            let tx = self.total_tx();
            let rx = self.total_rx();
            let secs = elapsed.as_secs_f64();
            state.rate = RateSample {
                tx_bytes_per_sec: tx.saturating_sub(state.last_tx) as f64 / secs,
                rx_bytes_per_sec: rx.saturating_sub(state.last_rx) as f64 / secs,
            };
            state.last_tx = tx;
            state.last_rx = rx;
            state.last_at = Instant::now();
        }

        state.rate
    }

    /// Reset counters and the cached sample (between runs).
    pub fn reset(&self) {
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        let mut state = match self.sample.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.last_tx = 0;
        state.last_rx = 0;
        state.last_at = Instant::now();
        state.rate = RateSample::default();
    }
}

/// Human-readable binary byte count ("1023 B", "1.5 MiB").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = TransferStats::new();
        stats.record_tx(100);
        stats.record_tx(50);
        stats.record_rx(200);
        assert_eq!(stats.total_tx(), 150);
        assert_eq!(stats.total_rx(), 200);

        stats.reset();
        assert_eq!(stats.total_tx(), 0);
        assert_eq!(stats.total_rx(), 0);
    }

    #[test]
    fn test_sample_cached_within_window() {
        let stats = TransferStats::new();
        stats.record_tx(1_000_000);
        // within the first window the initial (zero) sample is returned
        let sample = stats.sample();
        assert_eq!(sample.tx_bytes_per_sec, 0.0);
    }

    #[test]
    fn test_sample_after_window() {
        let stats = TransferStats::new();
        {
            let mut state = stats.sample.lock().unwrap();
            state.last_at = Instant::now() - Duration::from_secs(2);
        }
        stats.record_tx(2048);
        stats.record_rx(4096);

        let sample = stats.sample();
        assert!(sample.tx_bytes_per_sec > 0.0);
        assert!(sample.rx_bytes_per_sec > sample.tx_bytes_per_sec);

        let formatted = sample.formatted();
        assert!(formatted[0].ends_with("/s"));
        assert!(formatted[1].ends_with("/s"));
    }
}
